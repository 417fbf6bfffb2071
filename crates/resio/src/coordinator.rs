//! # Fetch Coordinator
//!
//! This module tracks one logical fetch task per resource key. Concurrent
//! requests for the same key coalesce onto the existing task instead of
//! issuing duplicate downloads, and the single result is fanned out to every
//! observer still attached (and alive) when the fetch settles.
//!
//! Observers are held as weak references. Detaching one observer never
//! aborts a fetch that other observers still depend on; whether a fetch with
//! zero remaining observers is aborted is a configurable policy, off by
//! default.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;
use crate::observer::FetchObserver;
use crate::transport::ByteTransport;

/// Hook run after a successful fetch, before observers are notified.
pub type SuccessHook = Box<dyn Fn(&str, &Bytes) + Send + Sync>;

/// Lifecycle of a fetch task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Created, waiting for a worker permit
    Pending,
    /// Transport fetch in progress
    Running,
    /// Result delivered; the task leaves the table with this state
    Completed,
    /// Aborted with no remaining observers
    Cancelled,
}

impl TaskState {
    fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Observer identity is the allocation address, ignoring the vtable half of
/// the fat pointer (dyn vtables are not unique across codegen units).
fn same_observer(a: &Weak<dyn FetchObserver>, b: &Weak<dyn FetchObserver>) -> bool {
    std::ptr::eq(a.as_ptr() as *const (), b.as_ptr() as *const ())
}

/// One logical download, shared by every requester of its key
struct FetchTask {
    state: TaskState,
    /// Weak to avoid ownership cycles; dead entries are reaped lazily
    observers: Vec<Weak<dyn FetchObserver>>,
    handle: Option<JoinHandle<()>>,
}

impl FetchTask {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            observers: Vec::new(),
            handle: None,
        }
    }

    /// Attach an observer unless it is already attached.
    fn attach(&mut self, observer: Weak<dyn FetchObserver>) {
        if !self.observers.iter().any(|o| same_observer(o, &observer)) {
            self.observers.push(observer);
        }
    }

    /// Drop `target` and any dead references.
    fn detach(&mut self, target: &Weak<dyn FetchObserver>) {
        self.observers
            .retain(|o| !same_observer(o, target) && o.strong_count() > 0);
    }
}

struct CoordinatorInner {
    transport: Arc<dyn ByteTransport>,
    /// Task table; the single coarse lock makes check-then-create atomic,
    /// which is what prevents duplicate fetches for one key
    tasks: Mutex<HashMap<String, FetchTask>>,
    /// Bounds the number of transport fetches running at once
    permits: Arc<Semaphore>,
    cancel_when_unobserved: bool,
    on_success: Mutex<Option<SuccessHook>>,
}

impl CoordinatorInner {
    /// Settle the task for `key`: remove it from the table, reap dead
    /// observers, run the success hook, then deliver the outcome.
    ///
    /// The table mutation happens under one lock acquisition, so a request
    /// racing this either attaches before removal (and lands in the
    /// snapshot) or finds no task and starts a fresh fetch.
    fn complete(&self, key: &str, outcome: Result<Bytes, FetchError>) {
        let observers = {
            let mut tasks = self.tasks.lock();
            let Some(mut task) = tasks.remove(key) else {
                // Cancelled between the transport call and settlement.
                return;
            };
            task.state = TaskState::Completed;
            task.observers
        };

        let live: Vec<Arc<dyn FetchObserver>> =
            observers.iter().filter_map(Weak::upgrade).collect();

        match &outcome {
            Ok(payload) => {
                if let Some(hook) = self.on_success.lock().as_ref() {
                    hook(key, payload);
                }
                debug!(
                    key,
                    size = payload.len(),
                    observers = live.len(),
                    "fetch completed, fanning out"
                );
            }
            Err(error) => {
                warn!(key, %error, observers = live.len(), "fetch failed, fanning out");
            }
        }

        // One fetch task per key and delivery runs serially on it, so no
        // observer ever sees concurrent callbacks for the same key.
        for observer in live {
            observer.on_result(key, outcome.as_ref(), false);
        }
    }
}

/// Coalesces duplicate fetch requests and fans results out to observers.
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    /// Create a coordinator over the given transport.
    pub fn new(
        transport: Arc<dyn ByteTransport>,
        max_concurrent_fetches: usize,
        cancel_when_unobserved: bool,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                tasks: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
                cancel_when_unobserved,
                on_success: Mutex::new(None),
            }),
        }
    }

    /// Install the hook run on each successful fetch before fan-out. The
    /// facade uses this to populate its cache.
    pub fn set_success_hook(&self, hook: SuccessHook) {
        *self.inner.on_success.lock() = Some(hook);
    }

    /// Register `observer`'s interest in `key`, starting a fetch if no task
    /// for the key is in flight.
    ///
    /// Attaching an already-attached observer is a no-op. Malformed keys are
    /// rejected before any task is created. Must be called from within a
    /// tokio runtime.
    pub fn request(
        &self,
        key: &str,
        observer: &Arc<dyn FetchObserver>,
    ) -> Result<(), FetchError> {
        Url::parse(key).map_err(|e| FetchError::InvalidKey(format!("{key}: {e}")))?;

        let weak = Arc::downgrade(observer);
        let spawn_needed = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(key) {
                Some(task) if !task.state.is_terminal() => {
                    task.attach(weak);
                    false
                }
                _ => {
                    let mut task = FetchTask::new();
                    task.attach(weak);
                    tasks.insert(key.to_owned(), task);
                    true
                }
            }
        };

        if spawn_needed {
            debug!(key, "starting fetch task");
            self.spawn_fetch(key.to_owned());
        } else {
            debug!(key, "joined in-flight fetch task");
        }
        Ok(())
    }

    fn spawn_fetch(&self, key: String) {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            // Worker-pool bound: the task stays Pending until a permit
            // frees up. Held for the duration of the transport call.
            let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
                return;
            };

            {
                let mut tasks = inner.tasks.lock();
                match tasks.get_mut(&task_key) {
                    Some(task) => task.state = TaskState::Running,
                    // Cancelled before it ever ran.
                    None => return,
                }
            }

            let outcome = inner.transport.fetch_bytes(&task_key).await;
            inner.complete(&task_key, outcome);
        });

        let mut tasks = self.inner.tasks.lock();
        match tasks.get_mut(&key) {
            Some(task) => task.handle = Some(handle),
            // Already settled or cancelled while we were spawning.
            None => handle.abort(),
        }
    }

    /// Withdraw `observer`'s interest in `key`.
    ///
    /// The underlying fetch keeps running for the remaining observers, and
    /// by default even with none left; with `cancel_when_unobserved` the
    /// now-orphaned task is aborted and removed.
    pub fn detach(&self, key: &str, observer: &Arc<dyn FetchObserver>) {
        let target = Arc::downgrade(observer);
        let mut tasks = self.inner.tasks.lock();
        let Some(task) = tasks.get_mut(key) else {
            return;
        };
        task.detach(&target);

        if task.observers.is_empty() && self.inner.cancel_when_unobserved {
            if let Some(mut task) = tasks.remove(key) {
                task.state = TaskState::Cancelled;
                if let Some(handle) = task.handle.take() {
                    handle.abort();
                }
                debug!(key, "aborted fetch task with no remaining observers");
            }
        }
    }

    /// Withdraw `observer`'s interest in every key.
    pub fn detach_all(&self, observer: &Arc<dyn FetchObserver>) {
        let target = Arc::downgrade(observer);
        let mut tasks = self.inner.tasks.lock();
        if self.inner.cancel_when_unobserved {
            tasks.retain(|key, task| {
                task.detach(&target);
                if task.observers.is_empty() {
                    task.state = TaskState::Cancelled;
                    if let Some(handle) = task.handle.take() {
                        handle.abort();
                    }
                    debug!(key = %key, "aborted fetch task with no remaining observers");
                    false
                } else {
                    true
                }
            });
        } else {
            for task in tasks.values_mut() {
                task.detach(&target);
            }
        }
    }

    /// Number of fetch tasks currently in the table.
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}
