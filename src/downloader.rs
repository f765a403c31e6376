use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::cache::FileCache;
use crate::config::RetrieverConfig;
use crate::error::RetrievalError;
use crate::fanout::{ActiveRequestRegistry, CallbackFanout, RetrievalCallback};
use crate::locator::{Locator, RequestKey, Scheme};
use crate::result::{Progress, RetrievalResult};
use crate::retriever::{Retriever, StandardRetriever};
use crate::scheduler::{FetchTask, RetrievalScheduler, TaskWork};

/// One caller-supplied fetch description. Consumed by the facade; the
/// `cache` flag governs whether the cache is consulted before a transfer,
/// `conditional` whether the transfer revalidates against the cached copy.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub locator: Locator,
    pub cache: bool,
    pub conditional: bool,
    pub decompress: bool,
    pub priority: i32,
}

impl RetrievalRequest {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            cache: true,
            conditional: false,
            decompress: false,
            priority: 0,
        }
    }
}

/// Bundled in-process payloads for `res:` locators. Resolved synchronously,
/// never cached, never scheduled.
#[derive(Default)]
pub struct ResourceStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl ResourceStore {
    fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.entries.lock().unwrap().insert(name.to_string(), bytes);
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(name).cloned()
    }
}

/// Ticket for one submitted request. Waiting blocks on the fan-out the
/// request coalesced into; cancellation is best-effort and only reaches a
/// task that has not started executing.
pub struct RetrievalHandle {
    key: RequestKey,
    fanout: Arc<CallbackFanout>,
    scheduler: Arc<RetrievalScheduler>,
}

impl RetrievalHandle {
    pub fn wait(&self) -> Arc<RetrievalResult> {
        self.fanout.wait()
    }

    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(&self.key)
    }

    pub fn is_completed(&self) -> bool {
        self.fanout.is_completed()
    }

    pub fn progress(&self) -> &Progress {
        self.fanout.progress()
    }
}

/// Entry point for every other subsystem that needs remote bytes. Composes
/// the cache, the in-flight registry, and the scheduler; constructed once at
/// startup and shut down explicitly.
pub struct Downloader<R: Retriever> {
    shared: Arc<DownloaderShared<R>>,
}

impl<R: Retriever> Clone for Downloader<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct DownloaderShared<R: Retriever> {
    cache: Arc<FileCache>,
    registry: Arc<ActiveRequestRegistry>,
    scheduler: Arc<RetrievalScheduler>,
    retriever: Arc<R>,
    resources: ResourceStore,
}

impl Downloader<StandardRetriever> {
    pub fn new(config: RetrieverConfig) -> Result<Self, RetrievalError> {
        let retriever = StandardRetriever::new(config.connect_timeout, config.read_timeout)?;
        Self::with_retriever(config, retriever)
    }
}

impl<R: Retriever + 'static> Downloader<R> {
    /// Builds the facade around a caller-supplied transfer strategy. Used by
    /// tests to substitute the network.
    pub fn with_retriever(config: RetrieverConfig, retriever: R) -> Result<Self, RetrievalError> {
        let cache = Arc::new(match config.cache_root {
            Some(root) => FileCache::with_root(root),
            None => FileCache::new().map_err(|err| RetrievalError::Io(err.to_string()))?,
        });
        let registry = Arc::new(ActiveRequestRegistry::new());
        let scheduler = Arc::new(RetrievalScheduler::new(
            config.pool_size,
            config.bucket_granularity,
        ));
        scheduler.start_sweep(Arc::clone(&registry), config.sweep_interval);

        Ok(Self {
            shared: Arc::new(DownloaderShared {
                cache,
                registry,
                scheduler,
                retriever: Arc::new(retriever),
                resources: ResourceStore::default(),
            }),
        })
    }

    pub fn register_resource(&self, name: &str, bytes: Vec<u8>) {
        self.shared.resources.insert(name, bytes);
    }

    pub fn cache(&self) -> &FileCache {
        &self.shared.cache
    }

    pub fn is_active(&self, locator: &Locator, conditional: bool) -> bool {
        self.shared.registry.contains(&locator.key(conditional))
    }

    pub fn pending_count(&self) -> usize {
        self.shared.scheduler.pending_count()
    }

    /// Stops the worker pool and the sweep. Pending tasks are abandoned and
    /// their waiters receive a cancelled outcome; running transfers finish.
    pub fn shutdown(&self) {
        self.shared.scheduler.shutdown();
    }

    /// Registers a request under its coalescing identity and schedules a
    /// transfer when this is the first request for that identity. Every
    /// other path through the facade funnels into here.
    pub fn submit(
        &self,
        request: RetrievalRequest,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        self.enqueue(request, Some(callback))
    }

    /// Blocking fetch that prefers the cache: a cached payload is returned
    /// without any transfer, otherwise the calling thread waits for the
    /// scheduled fetch and the payload is written back to the cache.
    pub fn fetch(&self, request: RetrievalRequest) -> Result<Arc<RetrievalResult>, RetrievalError> {
        let mut request = request;
        request.conditional = false;
        if request.locator.scheme() == Scheme::Resource {
            return raise(Arc::new(self.shared.resolve_resource(&request.locator)));
        }
        if request.cache {
            if let Some(data) = self.shared.cache_lookup(&request.locator) {
                debug!(locator = %request.locator, "served from cache");
                return Ok(Arc::new(RetrievalResult::cached(request.locator, data)));
            }
        }
        let handle = self.enqueue(request, None);
        raise(handle.wait())
    }

    /// Blocking fetch that revalidates any cached copy. Unchanged sources
    /// yield the cached bytes; new payloads replace them; a failed
    /// revalidation falls back to the cached copy when one exists.
    pub fn fetch_if_modified(
        &self,
        request: RetrievalRequest,
    ) -> Result<Arc<RetrievalResult>, RetrievalError> {
        let mut request = request;
        request.conditional = true;
        if request.locator.scheme() == Scheme::Resource {
            return raise(Arc::new(self.shared.resolve_resource(&request.locator)));
        }
        let locator = request.locator.clone();
        let handle = self.enqueue(request, None);
        let result = handle.wait();

        if result.not_modified() {
            return match self.shared.cache_lookup(&locator) {
                Some(data) => Ok(Arc::new(RetrievalResult::revalidated(locator, data))),
                None => Ok(result),
            };
        }
        if let Some(error) = result.error() {
            if let Some(data) = self.shared.cache_lookup(&locator) {
                warn!(%locator, %error, "revalidation failed; serving cached copy");
                return Ok(Arc::new(RetrievalResult::cached(locator, data)));
            }
            return Err(error.clone());
        }
        Ok(result)
    }

    /// Asynchronous fetch that prefers the cache: a cached payload is
    /// delivered to the callback immediately; otherwise the fetch is
    /// scheduled and the payload cached before delivery.
    pub fn fetch_async(
        &self,
        request: RetrievalRequest,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        let mut request = request;
        request.conditional = false;
        if request.locator.scheme() == Scheme::Resource {
            return self.resolve_resource_now(&request.locator, callback);
        }
        if request.cache {
            if let Some(data) = self.shared.cache_lookup(&request.locator) {
                let result = Arc::new(RetrievalResult::cached(request.locator.clone(), data));
                return self.deliver_now(&request.locator, result, callback);
            }
        }
        self.enqueue(request, Some(callback))
    }

    /// Asynchronous revalidation: any cached copy is delivered first, then a
    /// conditional fetch runs in the background and its outcome is delivered
    /// as a second call, including the not-modified case so the caller can
    /// tell "checked, unchanged" from "no check happened".
    pub fn fetch_async_if_modified(
        &self,
        request: RetrievalRequest,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        let mut request = request;
        request.conditional = true;
        if request.locator.scheme() == Scheme::Resource {
            return self.resolve_resource_now(&request.locator, callback);
        }
        if request.cache {
            if let Some(data) = self.shared.cache_lookup(&request.locator) {
                let cached = Arc::new(RetrievalResult::cached(request.locator.clone(), data));
                callback.on_result(cached);
            }
        }
        self.enqueue(request, Some(callback))
    }

    /// Asynchronous fetch that never reads the cache but still overwrites it
    /// on success.
    pub fn fetch_async_no_cache(
        &self,
        request: RetrievalRequest,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        let mut request = request;
        request.cache = false;
        request.conditional = false;
        if request.locator.scheme() == Scheme::Resource {
            return self.resolve_resource_now(&request.locator, callback);
        }
        self.enqueue(request, Some(callback))
    }

    pub fn invalidate(&self, locator: &Locator) {
        if let Err(err) = self.shared.cache.invalidate(locator) {
            warn!(%locator, error = %err, "cache invalidation failed");
        }
    }

    fn enqueue(
        &self,
        request: RetrievalRequest,
        callback: Option<Arc<dyn RetrievalCallback>>,
    ) -> RetrievalHandle {
        let key = request.locator.key(request.conditional);
        let if_modified_since = if request.conditional {
            self.shared.cache_last_modified(&request.locator)
        } else {
            None
        };

        let registration = self.shared.registry.register_or_attach(&key, callback);
        if registration.newly_registered {
            let work = FetchWork {
                cache: Arc::clone(&self.shared.cache),
                registry: Arc::clone(&self.shared.registry),
                retriever: Arc::clone(&self.shared.retriever),
                locator: request.locator,
                key: key.clone(),
                if_modified_since,
                decompress: request.decompress,
                fanout: Arc::clone(&registration.fanout),
            };
            self.shared.scheduler.submit(FetchTask::new(
                key.clone(),
                request.priority,
                Box::new(work),
            ));
        } else {
            debug!(%key, "request coalesced onto in-flight fetch");
        }

        RetrievalHandle {
            key,
            fanout: registration.fanout,
            scheduler: Arc::clone(&self.shared.scheduler),
        }
    }

    fn resolve_resource_now(
        &self,
        locator: &Locator,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        let result = Arc::new(self.shared.resolve_resource(locator));
        self.deliver_now(locator, result, callback)
    }

    /// Completes a detached fan-out with an already known result and invokes
    /// the callback on the calling thread.
    fn deliver_now(
        &self,
        locator: &Locator,
        result: Arc<RetrievalResult>,
        callback: Arc<dyn RetrievalCallback>,
    ) -> RetrievalHandle {
        let fanout = Arc::new(CallbackFanout::new());
        fanout.add(callback);
        fanout.complete(result);
        RetrievalHandle {
            key: locator.key(false),
            fanout,
            scheduler: Arc::clone(&self.shared.scheduler),
        }
    }
}

impl<R: Retriever> DownloaderShared<R> {
    fn resolve_resource(&self, locator: &Locator) -> RetrievalResult {
        match locator.resource_name().and_then(|name| self.resources.get(name)) {
            Some(bytes) => RetrievalResult::success(locator.clone(), bytes, None),
            None => RetrievalResult::failed(
                locator.clone(),
                RetrievalError::Io(format!("unknown in-process resource: {locator}")),
            ),
        }
    }

    fn cache_lookup(&self, locator: &Locator) -> Option<Vec<u8>> {
        match self.cache.lookup(locator) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%locator, error = %err, "cache read failed; treated as miss");
                None
            }
        }
    }

    fn cache_last_modified(&self, locator: &Locator) -> Option<SystemTime> {
        match self.cache.last_modified(locator) {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(%locator, error = %err, "cache stat failed; treated as miss");
                None
            }
        }
    }

}

/// The scheduled body of one fetch: run the transfer, persist a successful
/// payload, drop the in-flight entry, and fan the outcome out. Holds only
/// the leaf services it touches so a queued task cannot keep the facade
/// alive.
struct FetchWork<R: Retriever> {
    cache: Arc<FileCache>,
    registry: Arc<ActiveRequestRegistry>,
    retriever: Arc<R>,
    locator: Locator,
    key: RequestKey,
    if_modified_since: Option<SystemTime>,
    decompress: bool,
    fanout: Arc<CallbackFanout>,
}

impl<R: Retriever + 'static> TaskWork for FetchWork<R> {
    fn execute(self: Box<Self>) {
        let outcome = self.retriever.retrieve(
            &self.locator,
            self.if_modified_since,
            self.decompress,
            self.fanout.progress(),
        );
        let result = match outcome {
            Ok(retrieval) if retrieval.not_modified => {
                RetrievalResult::unchanged(self.locator.clone())
            }
            Ok(retrieval) => {
                let data = retrieval.data.unwrap_or_default();
                if !data.is_empty() {
                    if let Err(err) = self.cache.store(&self.locator, &data) {
                        warn!(locator = %self.locator, error = %err, "cache write failed; result not persisted");
                    }
                }
                RetrievalResult::success(self.locator.clone(), data, retrieval.content_type)
            }
            Err(error) => {
                warn!(locator = %self.locator, %error, "retrieval failed");
                RetrievalResult::failed(self.locator.clone(), error)
            }
        };
        self.registry.remove(&self.key);
        self.fanout.complete(Arc::new(result));
    }

    fn abandon(self: Box<Self>) {
        self.registry.remove(&self.key);
        self.fanout.complete(Arc::new(RetrievalResult::failed(
            self.locator.clone(),
            RetrievalError::Cancelled(self.locator.to_string()),
        )));
    }
}

fn raise(result: Arc<RetrievalResult>) -> Result<Arc<RetrievalResult>, RetrievalError> {
    match result.error() {
        Some(error) => Err(error.clone()),
        None => Ok(result),
    }
}
