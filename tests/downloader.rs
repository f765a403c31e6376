use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use terra_retriever::config::RetrieverConfig;
use terra_retriever::downloader::{Downloader, RetrievalRequest};
use terra_retriever::error::RetrievalError;
use terra_retriever::fanout::RetrievalCallback;
use terra_retriever::locator::Locator;
use terra_retriever::result::{Progress, Retrieval, RetrievalResult};
use terra_retriever::retriever::Retriever;

#[derive(Default)]
struct MockBehavior {
    payload: Vec<u8>,
    content_type: Option<String>,
    not_modified_when_conditional: bool,
    error: Option<RetrievalError>,
    started: Option<Mutex<Sender<()>>>,
    gate: Option<Mutex<Receiver<()>>>,
}

struct MockRetriever {
    calls: Arc<AtomicUsize>,
    behavior: MockBehavior,
}

impl MockRetriever {
    fn new(behavior: MockBehavior) -> (Arc<AtomicUsize>, Self) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::clone(&calls),
            Self {
                calls,
                behavior,
            },
        )
    }

    fn with_payload(payload: &[u8]) -> (Arc<AtomicUsize>, Self) {
        Self::new(MockBehavior {
            payload: payload.to_vec(),
            content_type: Some("image/png".to_string()),
            ..MockBehavior::default()
        })
    }
}

impl Retriever for MockRetriever {
    fn retrieve(
        &self,
        _locator: &Locator,
        if_modified_since: Option<SystemTime>,
        _decompress: bool,
        progress: &Progress,
    ) -> Result<Retrieval, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(started) = &self.behavior.started {
            started.lock().unwrap().send(()).ok();
        }
        if let Some(gate) = &self.behavior.gate {
            gate.lock().unwrap().recv().ok();
        }
        if let Some(error) = &self.behavior.error {
            return Err(error.clone());
        }
        if self.behavior.not_modified_when_conditional && if_modified_since.is_some() {
            return Ok(Retrieval::not_modified());
        }
        progress.set_content_length(self.behavior.payload.len() as u64);
        progress.add_bytes_read(self.behavior.payload.len() as u64);
        Ok(Retrieval::with_data(
            self.behavior.payload.clone(),
            self.behavior.content_type.clone(),
        ))
    }
}

fn test_config(temp: &tempfile::TempDir) -> RetrieverConfig {
    let mut config = RetrieverConfig::default();
    config.cache_root = Some(Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap());
    config.pool_size = 2;
    config.sweep_interval = Duration::from_millis(100);
    config
}

fn collecting_callback(
    results: &Arc<Mutex<Vec<Arc<RetrievalResult>>>>,
) -> Arc<dyn RetrievalCallback> {
    let results = Arc::clone(results);
    Arc::new(move |result: Arc<RetrievalResult>| {
        results.lock().unwrap().push(result);
    })
}

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn fetch_populates_cache_then_serves_from_it() {
    let temp = tempfile::tempdir().unwrap();
    let (calls, mock) = MockRetriever::with_payload(b"tile-bytes");
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/tile.png".parse().unwrap();

    let first = downloader.fetch(RetrievalRequest::new(locator.clone())).unwrap();
    assert_eq!(first.data().unwrap(), &b"tile-bytes"[..]);
    assert!(!first.from_cache());
    assert_eq!(first.content_type(), Some("image/png"));
    assert!(downloader.cache().entry_path(&locator).as_std_path().is_file());

    let second = downloader.fetch(RetrievalRequest::new(locator)).unwrap();
    assert!(second.from_cache());
    assert_eq!(second.data().unwrap(), &b"tile-bytes"[..]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    downloader.shutdown();
}

#[test]
fn concurrent_requests_coalesce_into_one_transfer() {
    let temp = tempfile::tempdir().unwrap();
    let (started_tx, started_rx) = channel();
    let (gate_tx, gate_rx) = channel();
    let (calls, mock) = MockRetriever::new(MockBehavior {
        payload: b"shared".to_vec(),
        started: Some(Mutex::new(started_tx)),
        gate: Some(Mutex::new(gate_rx)),
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/popular.png".parse().unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let _first = downloader.fetch_async(
        RetrievalRequest::new(locator.clone()),
        collecting_callback(&results),
    );
    started_rx.recv().unwrap();

    // The transfer is now blocked inside the worker; these attach to it.
    let _second = downloader.fetch_async(
        RetrievalRequest::new(locator.clone()),
        collecting_callback(&results),
    );
    let _third = downloader.fetch_async(
        RetrievalRequest::new(locator.clone()),
        collecting_callback(&results),
    );
    assert!(downloader.is_active(&locator, false));

    gate_tx.send(()).unwrap();
    wait_until("three deliveries", || results.lock().unwrap().len() == 3);

    let results = results.lock().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&results[0], &results[1]));
    assert!(Arc::ptr_eq(&results[1], &results[2]));
    assert_eq!(results[0].data().unwrap(), &b"shared"[..]);

    downloader.shutdown();
}

#[test]
fn conditional_fetch_returns_cached_bytes_when_unchanged() {
    let temp = tempfile::tempdir().unwrap();
    let (calls, mock) = MockRetriever::new(MockBehavior {
        payload: b"fresh".to_vec(),
        not_modified_when_conditional: true,
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/stable.png".parse().unwrap();

    downloader.cache().store(&locator, b"cached-copy").unwrap();

    let result = downloader
        .fetch_if_modified(RetrievalRequest::new(locator.clone()))
        .unwrap();
    assert!(result.not_modified());
    assert!(result.from_cache());
    assert_eq!(result.data().unwrap(), &b"cached-copy"[..]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        downloader.cache().lookup(&locator).unwrap().unwrap(),
        b"cached-copy"
    );

    downloader.shutdown();
}

#[test]
fn async_revalidation_delivers_cached_copy_then_outcome() {
    let temp = tempfile::tempdir().unwrap();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        not_modified_when_conditional: true,
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/layer.xml".parse().unwrap();

    downloader.cache().store(&locator, b"cached-doc").unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let handle = downloader.fetch_async_if_modified(
        RetrievalRequest::new(locator),
        collecting_callback(&results),
    );
    handle.wait();
    wait_until("both deliveries", || results.lock().unwrap().len() == 2);

    let results = results.lock().unwrap();
    assert!(results[0].from_cache());
    assert_eq!(results[0].data().unwrap(), &b"cached-doc"[..]);
    assert!(results[1].not_modified());
    assert!(!results[1].has_data());

    downloader.shutdown();
}

#[test]
fn no_cache_fetch_ignores_but_overwrites_cache() {
    let temp = tempfile::tempdir().unwrap();
    let (calls, mock) = MockRetriever::with_payload(b"fresh-bytes");
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/volatile.json".parse().unwrap();

    downloader.cache().store(&locator, b"stale-bytes").unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let handle = downloader.fetch_async_no_cache(
        RetrievalRequest::new(locator.clone()),
        collecting_callback(&results),
    );
    let result = handle.wait();

    assert!(!result.from_cache());
    assert_eq!(result.data().unwrap(), &b"fresh-bytes"[..]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        downloader.cache().lookup(&locator).unwrap().unwrap(),
        b"fresh-bytes"
    );

    downloader.shutdown();
}

#[test]
fn cancel_reaches_only_pending_tasks() {
    let temp = tempfile::tempdir().unwrap();
    let (started_tx, started_rx) = channel();
    let (gate_tx, gate_rx) = channel();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        payload: b"slow".to_vec(),
        started: Some(Mutex::new(started_tx)),
        gate: Some(Mutex::new(gate_rx)),
        ..MockBehavior::default()
    });
    let mut config = test_config(&temp);
    config.pool_size = 1;
    let downloader = Downloader::with_retriever(config, mock).unwrap();

    let busy: Locator = "http://host/busy.png".parse().unwrap();
    let queued: Locator = "http://host/queued.png".parse().unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let running = downloader.fetch_async(
        RetrievalRequest::new(busy),
        collecting_callback(&results),
    );
    started_rx.recv().unwrap();

    let pending = downloader.fetch_async(
        RetrievalRequest::new(queued.clone()),
        collecting_callback(&results),
    );
    assert!(pending.cancel());
    let cancelled = pending.wait();
    assert_matches!(cancelled.error(), Some(RetrievalError::Cancelled(_)));
    assert!(!downloader.is_active(&queued, false));

    // The running transfer cannot be cancelled; it runs to completion.
    assert!(!running.cancel());
    gate_tx.send(()).unwrap();
    let finished = running.wait();
    assert_eq!(finished.data().unwrap(), &b"slow"[..]);

    downloader.shutdown();
}

#[test]
fn sync_fetch_propagates_errors() {
    let temp = tempfile::tempdir().unwrap();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        error: Some(RetrievalError::Protocol {
            status: 404,
            message: "no such tile".to_string(),
        }),
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/missing.png".parse().unwrap();

    let err = downloader
        .fetch(RetrievalRequest::new(locator.clone()))
        .unwrap_err();
    assert_matches!(err, RetrievalError::Protocol { status: 404, .. });
    // Failed fetches never create cache entries.
    assert!(downloader.cache().lookup(&locator).unwrap().is_none());

    downloader.shutdown();
}

#[test]
fn async_fetch_delivers_error_in_result() {
    let temp = tempfile::tempdir().unwrap();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        error: Some(RetrievalError::Connection("refused".to_string())),
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://unreachable/tile.png".parse().unwrap();

    let handle = downloader.fetch_async(
        RetrievalRequest::new(locator),
        Arc::new(|_result: Arc<RetrievalResult>| {}),
    );
    let result = handle.wait();
    assert!(!result.is_ok());
    assert_matches!(result.error(), Some(RetrievalError::Connection(_)));

    downloader.shutdown();
}

#[test]
fn in_process_resources_bypass_cache_and_scheduler() {
    let temp = tempfile::tempdir().unwrap();
    let (calls, mock) = MockRetriever::with_payload(b"unused");
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    downloader.register_resource("icons/compass.png", b"embedded".to_vec());

    let locator: Locator = "res:icons/compass.png".parse().unwrap();
    let result = downloader.fetch(RetrievalRequest::new(locator.clone())).unwrap();
    assert_eq!(result.data().unwrap(), &b"embedded"[..]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(downloader.cache().lookup(&locator).unwrap().is_none());

    let missing: Locator = "res:icons/unknown.png".parse().unwrap();
    let err = downloader.fetch(RetrievalRequest::new(missing)).unwrap_err();
    assert_matches!(err, RetrievalError::Io(_));

    downloader.shutdown();
}

#[test]
fn revalidation_without_cached_copy_surfaces_errors() {
    let temp = tempfile::tempdir().unwrap();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        error: Some(RetrievalError::Connection("timed out".to_string())),
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/uncached.png".parse().unwrap();

    let err = downloader
        .fetch_if_modified(RetrievalRequest::new(locator))
        .unwrap_err();
    assert_matches!(err, RetrievalError::Connection(_));

    downloader.shutdown();
}

#[test]
fn revalidation_with_cached_copy_survives_errors() {
    let temp = tempfile::tempdir().unwrap();
    let (_calls, mock) = MockRetriever::new(MockBehavior {
        error: Some(RetrievalError::Connection("timed out".to_string())),
        ..MockBehavior::default()
    });
    let downloader = Downloader::with_retriever(test_config(&temp), mock).unwrap();
    let locator: Locator = "http://host/cached.png".parse().unwrap();

    downloader.cache().store(&locator, b"last-good").unwrap();

    let result = downloader
        .fetch_if_modified(RetrievalRequest::new(locator))
        .unwrap();
    assert!(result.from_cache());
    assert_eq!(result.data().unwrap(), &b"last-good"[..]);

    downloader.shutdown();
}
