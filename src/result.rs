use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RetrievalError;
use crate::locator::Locator;

/// Byte counters for one transfer, updated by the worker while it reads and
/// observable from any thread holding the handle.
#[derive(Debug, Default)]
pub struct Progress {
    content_length: AtomicU64,
    bytes_read: AtomicU64,
}

impl Progress {
    pub fn content_length(&self) -> Option<u64> {
        match self.content_length.load(Ordering::Relaxed) {
            0 => None,
            len => Some(len),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn set_content_length(&self, len: u64) {
        self.content_length.store(len, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }
}

/// Raw outcome of one transfer, before cache bookkeeping.
#[derive(Debug)]
pub struct Retrieval {
    pub data: Option<Vec<u8>>,
    pub not_modified: bool,
    pub content_type: Option<String>,
}

impl Retrieval {
    pub fn with_data(data: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            data: Some(data),
            not_modified: false,
            content_type,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            data: None,
            not_modified: true,
            content_type: None,
        }
    }
}

/// Final outcome delivered to every caller waiting on one logical request.
/// Immutable once built; shared by reference among all of them.
#[derive(Debug)]
pub struct RetrievalResult {
    locator: Locator,
    data: Option<Vec<u8>>,
    from_cache: bool,
    not_modified: bool,
    content_type: Option<String>,
    error: Option<RetrievalError>,
}

impl RetrievalResult {
    pub(crate) fn success(locator: Locator, data: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            locator,
            data: Some(data),
            from_cache: false,
            not_modified: false,
            content_type,
            error: None,
        }
    }

    pub(crate) fn cached(locator: Locator, data: Vec<u8>) -> Self {
        Self {
            locator,
            data: Some(data),
            from_cache: true,
            not_modified: false,
            content_type: None,
            error: None,
        }
    }

    /// Cached bytes confirmed current by a conditional fetch.
    pub(crate) fn revalidated(locator: Locator, data: Vec<u8>) -> Self {
        Self {
            locator,
            data: Some(data),
            from_cache: true,
            not_modified: true,
            content_type: None,
            error: None,
        }
    }

    pub(crate) fn unchanged(locator: Locator) -> Self {
        Self {
            locator,
            data: None,
            from_cache: false,
            not_modified: true,
            content_type: None,
            error: None,
        }
    }

    pub(crate) fn failed(locator: Locator, error: RetrievalError) -> Self {
        Self {
            locator,
            data: None,
            from_cache: false,
            not_modified: false,
            content_type: None,
            error: Some(error),
        }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn not_modified(&self) -> bool {
        self.not_modified
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn error(&self) -> Option<&RetrievalError> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
