use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::RetrievalError;
use crate::fanout::ActiveRequestRegistry;
use crate::locator::{Locator, RequestKey};
use crate::result::RetrievalResult;

/// The deferred body of a fetch task. `execute` performs the transfer and
/// delivers the outcome; `abandon` delivers a cancelled outcome without any
/// transfer. Exactly one of the two is ever called.
pub trait TaskWork: Send {
    fn execute(self: Box<Self>);
    fn abandon(self: Box<Self>);
}

/// One schedulable transfer. Identity is the request key, not the task
/// instance, which lets the scheduler spot a literal duplicate submission.
pub struct FetchTask {
    key: RequestKey,
    priority: i32,
    submitted_at: Instant,
    work: Box<dyn TaskWork>,
}

impl FetchTask {
    pub fn new(key: RequestKey, priority: i32, work: Box<dyn TaskWork>) -> Self {
        Self {
            key,
            priority,
            submitted_at: Instant::now(),
            work,
        }
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[cfg(test)]
    fn submitted_at(mut self, at: Instant) -> Self {
        self.submitted_at = at;
        self
    }
}

/// Bounded worker pool executing fetch tasks from a priority queue, plus a
/// periodic sweep that reconciles the in-flight registry against what is
/// actually still scheduled. Created explicitly and shut down explicitly;
/// dropping the scheduler stops every thread.
pub struct RetrievalScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    sweep_signal: Condvar,
    bucket_granularity: Duration,
}

struct State {
    pending: Vec<FetchTask>,
    running: HashSet<RequestKey>,
    shutdown: bool,
}

impl RetrievalScheduler {
    pub fn new(pool_size: usize, bucket_granularity: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: Vec::new(),
                running: HashSet::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            sweep_signal: Condvar::new(),
            bucket_granularity,
        });

        let workers = (0..pool_size.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            sweeper: Mutex::new(None),
        }
    }

    /// Starts the periodic reconciliation sweep. Entries whose task the
    /// scheduler no longer knows and whose fan-out never completed are
    /// finished with a cancelled outcome so nothing waits on them forever.
    pub fn start_sweep(&self, registry: Arc<ActiveRequestRegistry>, interval: Duration) {
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || sweep_loop(&shared, &registry, interval));
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Queues a task unless an equal one is already pending or running; a
    /// duplicate is dropped because the in-flight entry it belongs to will
    /// be completed by the task already scheduled.
    pub fn submit(&self, task: FetchTask) -> bool {
        let rejected = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                Some(task)
            } else if state.running.contains(&task.key)
                || state.pending.iter().any(|pending| pending.key == task.key)
            {
                warn!(key = %task.key, "duplicate task dropped");
                drop(task);
                return false;
            } else {
                debug!(key = %task.key, priority = task.priority, "task queued");
                state.pending.push(task);
                None
            }
        };
        match rejected {
            Some(task) => {
                task.work.abandon();
                false
            }
            None => {
                self.shared.work_ready.notify_one();
                true
            }
        }
    }

    /// True while a task with this key is pending or running.
    pub fn contains(&self, key: &RequestKey) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.running.contains(key) || state.pending.iter().any(|task| &task.key == key)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.shared.state.lock().unwrap().running.len()
    }

    /// Best-effort cancellation: only a task that has not started executing
    /// can be removed. Its work is abandoned so waiters are notified.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let task = {
            let mut state = self.shared.state.lock().unwrap();
            match state.pending.iter().position(|task| &task.key == key) {
                Some(index) => Some(state.pending.swap_remove(index)),
                None => None,
            }
        };
        match task {
            Some(task) => {
                debug!(%key, "pending task cancelled");
                task.work.abandon();
                true
            }
            None => false,
        }
    }

    /// Stops accepting work, abandons everything still pending, and joins
    /// the worker and sweep threads. Running transfers finish first.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        self.shared.work_ready.notify_all();
        self.shared.sweep_signal.notify_all();
        for task in drained {
            task.work.abandon();
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetrievalScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                let picked =
                    next_index(&state.pending, Instant::now(), shared.bucket_granularity);
                match picked {
                    Some(index) => {
                        let task = state.pending.swap_remove(index);
                        if state.running.contains(&task.key) {
                            warn!(key = %task.key, "duplicate task cancelled before start");
                            continue;
                        }
                        state.running.insert(task.key.clone());
                        break task;
                    }
                    None => {
                        state = shared.work_ready.wait(state).unwrap();
                    }
                }
            }
        };

        let key = task.key.clone();
        debug!(%key, "task started");
        task.work.execute();

        let mut state = shared.state.lock().unwrap();
        state.running.remove(&key);
    }
}

/// Picks the next task: oldest time bucket first, then highest priority,
/// then earliest submission. Buckets are coarse on purpose so a burst of
/// high-priority work cannot starve a long-pending request.
fn next_index(pending: &[FetchTask], now: Instant, bucket_granularity: Duration) -> Option<usize> {
    let granularity = bucket_granularity.as_millis().max(1);
    pending
        .iter()
        .enumerate()
        .min_by_key(|(_, task)| {
            let elapsed = now.saturating_duration_since(task.submitted_at).as_millis();
            (
                Reverse(elapsed / granularity),
                Reverse(task.priority),
                task.submitted_at,
            )
        })
        .map(|(index, _)| index)
}

fn sweep_loop(shared: &Shared, registry: &ActiveRequestRegistry, interval: Duration) {
    loop {
        {
            let state = shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let (state, _timeout) = shared.sweep_signal.wait_timeout(state, interval).unwrap();
            if state.shutdown {
                return;
            }
        }
        sweep_once(shared, registry);
    }
}

fn sweep_once(shared: &Shared, registry: &ActiveRequestRegistry) {
    let orphans: Vec<_> = {
        let state = shared.state.lock().unwrap();
        registry
            .snapshot()
            .into_iter()
            .filter(|(key, fanout)| {
                !state.running.contains(key)
                    && !state.pending.iter().any(|task| &task.key == key)
                    && !fanout.is_completed()
            })
            .collect()
    };

    for (key, fanout) in orphans {
        if registry.remove_if_same(&key, &fanout) {
            warn!(%key, "orphaned request entry swept");
            let locator: Locator = match key.locator().parse() {
                Ok(locator) => locator,
                Err(_) => continue,
            };
            fanout.complete(Arc::new(RetrievalResult::failed(
                locator.clone(),
                RetrievalError::Cancelled(locator.to_string()),
            )));
        }
    }
}
