use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::RetrievalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Http,
    Https,
    Resource,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Resource => "res",
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Address of a resource to fetch. Validated on construction; a malformed
/// locator is rejected before anything is registered or scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    raw: String,
    scheme: Scheme,
}

impl Locator {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Filesystem path behind a `file:` locator.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        if self.scheme != Scheme::File {
            return None;
        }
        let rest = &self.raw["file:".len()..];
        let path = rest.strip_prefix("//").unwrap_or(rest);
        Some(PathBuf::from(path))
    }

    /// Name behind a `res:` locator.
    pub fn resource_name(&self) -> Option<&str> {
        if self.scheme != Scheme::Resource {
            return None;
        }
        Some(&self.raw["res:".len()..])
    }

    /// Identity under which concurrent requests for this locator coalesce.
    pub fn key(&self, conditional: bool) -> RequestKey {
        RequestKey {
            scheme: self.scheme,
            locator: self.raw.clone(),
            conditional,
        }
    }

    /// Relative cache path for this locator: `!` doubled, then every
    /// character in `\ : * ? " < > |` replaced with `!`. Slashes survive,
    /// so entries form a directory tree under the cache root.
    pub fn cache_name(&self) -> String {
        escape_cache_name(&self.raw)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for Locator {
    type Err = RetrievalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (scheme_part, rest) = trimmed
            .split_once(':')
            .ok_or_else(|| RetrievalError::InvalidLocator(value.to_string()))?;
        if rest.is_empty() {
            return Err(RetrievalError::InvalidLocator(value.to_string()));
        }
        let scheme = match scheme_part.to_ascii_lowercase().as_str() {
            "file" => Scheme::File,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "res" => Scheme::Resource,
            _ => return Err(RetrievalError::InvalidLocator(value.to_string())),
        };
        Ok(Self {
            raw: trimmed.to_string(),
            scheme,
        })
    }
}

/// Composite key for in-flight request coalescing: scheme plus canonical
/// locator string plus whether the fetch carries a conditional timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    scheme: Scheme,
    locator: String,
    conditional: bool,
}

impl RequestKey {
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn conditional(&self) -> bool {
        self.conditional
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditional {
            write!(f, "{} (conditional)", self.locator)
        } else {
            write!(f, "{}", self.locator)
        }
    }
}

pub fn escape_cache_name(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '!' => escaped.push_str("!!"),
            '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => escaped.push('!'),
            _ => escaped.push(ch),
        }
    }
    escaped
}
