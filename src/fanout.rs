use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::locator::RequestKey;
use crate::result::{Progress, RetrievalResult};

/// Receiver for the outcome of one logical request. Invoked exactly once per
/// attachment.
pub trait RetrievalCallback: Send + Sync {
    fn on_result(&self, result: Arc<RetrievalResult>);
}

impl<F> RetrievalCallback for F
where
    F: Fn(Arc<RetrievalResult>) + Send + Sync,
{
    fn on_result(&self, result: Arc<RetrievalResult>) {
        self(result)
    }
}

/// Every callback waiting on one in-flight fetch, plus the outcome once it
/// exists. Attachment and completion are serialized through one lock, so a
/// callback either rides the fan-out or is invoked immediately with the
/// stored result; it can never miss both.
pub struct CallbackFanout {
    state: Mutex<FanoutState>,
    completed: Condvar,
    progress: Progress,
}

struct FanoutState {
    callbacks: Vec<Arc<dyn RetrievalCallback>>,
    result: Option<Arc<RetrievalResult>>,
}

impl CallbackFanout {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FanoutState {
                callbacks: Vec::new(),
                result: None,
            }),
            completed: Condvar::new(),
            progress: Progress::default(),
        }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Queues a callback, or invokes it immediately when the fetch has
    /// already completed. The immediate invocation happens outside the lock.
    pub fn add(&self, callback: Arc<dyn RetrievalCallback>) {
        let existing = {
            let mut state = self.state.lock().unwrap();
            match &state.result {
                Some(result) => Some(Arc::clone(result)),
                None => {
                    state.callbacks.push(callback.clone());
                    None
                }
            }
        };
        if let Some(result) = existing {
            callback.on_result(result);
        }
    }

    /// Stores the outcome and notifies every queued callback in attachment
    /// order. Only the first completion wins; later calls are ignored, which
    /// keeps delivery exactly-once when a sweep races the worker.
    pub fn complete(&self, result: Arc<RetrievalResult>) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_some() {
                return;
            }
            state.result = Some(Arc::clone(&result));
            std::mem::take(&mut state.callbacks)
        };
        self.completed.notify_all();
        for callback in callbacks {
            callback.on_result(Arc::clone(&result));
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().unwrap().result.is_some()
    }

    /// Blocks the calling thread until the outcome is available.
    pub fn wait(&self) -> Arc<RetrievalResult> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = &state.result {
                return Arc::clone(result);
            }
            state = self.completed.wait(state).unwrap();
        }
    }
}

impl Default for CallbackFanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches currently in flight, keyed by request identity. The lookup and
/// the registration happen under one lock, which is what guarantees at most
/// one transfer per identity.
pub struct ActiveRequestRegistry {
    entries: Mutex<HashMap<RequestKey, Arc<CallbackFanout>>>,
}

pub struct Registration {
    pub newly_registered: bool,
    pub fanout: Arc<CallbackFanout>,
}

impl ActiveRequestRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a callback to the in-flight entry for `key`, creating the
    /// entry when none exists. Returns whether this call created it; only
    /// the creator schedules a transfer.
    pub fn register_or_attach(
        &self,
        key: &RequestKey,
        callback: Option<Arc<dyn RetrievalCallback>>,
    ) -> Registration {
        let (fanout, newly_registered, late_callback) = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(fanout) => (Arc::clone(fanout), false, callback),
                None => {
                    let fanout = Arc::new(CallbackFanout::new());
                    if let Some(callback) = callback {
                        fanout.add(callback);
                    }
                    entries.insert(key.clone(), Arc::clone(&fanout));
                    debug!(%key, "registered in-flight request");
                    (fanout, true, None)
                }
            }
        };
        // Attaching to an existing entry happens outside the registry lock;
        // the fanout's own lock makes it race-free against completion.
        if let Some(callback) = late_callback {
            fanout.add(callback);
        }
        Registration {
            newly_registered,
            fanout,
        }
    }

    pub fn remove(&self, key: &RequestKey) -> Option<Arc<CallbackFanout>> {
        self.entries.lock().unwrap().remove(key)
    }

    /// Removes the entry only if it still holds this exact fanout, so a
    /// sweep cannot evict a fresh entry that reused the key.
    pub fn remove_if_same(&self, key: &RequestKey, fanout: &Arc<CallbackFanout>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, fanout) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(RequestKey, Arc<CallbackFanout>)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, fanout)| (key.clone(), Arc::clone(fanout)))
            .collect()
    }
}

impl Default for ActiveRequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
