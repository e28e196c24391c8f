//! Background task pool.
//!
//! Tasks carry an association (a store id). All tasks with the same
//! association are routed to the same worker thread, so work against one
//! store runs in submission order while different stores proceed in
//! parallel. A pool with no workers runs every task on the caller's thread.

use crate::batch::BatchTask;
use crate::manager::OpenTask;
use crate::store::PersistentStore;
use crossbeam_channel::{Receiver, Sender, unbounded};
use gridstore_common::{ExtentId, PersistenceError, Receipt, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use xxhash_rust::xxh64::xxh64;

/// Outcome of an asynchronous open or batch commit
#[derive(Debug)]
pub enum Completion {
    /// The request correlated by this receipt succeeded
    Done(Receipt),
    /// The request failed; the error is [`PersistenceError::Async`] and
    /// carries the receipt
    Failed(PersistenceError),
}

impl Completion {
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Sink for asynchronous completions
pub trait Collector: Send + Sync {
    fn add(&self, item: Completion) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Collector for Sender<Completion> {
    fn add(&self, item: Completion) -> Result<()> {
        self.send(item)
            .map_err(|_| PersistenceError::illegal_state("completion receiver has been dropped"))
    }
}

/// Add an item to a collector and flush it, logging rather than raising
/// any failure.
pub(crate) fn notify_collector(collector: &dyn Collector, item: Completion) {
    if let Err(e) = collector.add(item).and_then(|()| collector.flush()) {
        error!("Error adding an item to collector: {}", e);
    }
}

/// Queued unit of background work
pub(crate) enum Work {
    Open(OpenTask),
    DeleteExtent {
        store: PersistentStore,
        extent: ExtentId,
    },
    Batch(BatchTask),
}

impl Work {
    fn execute(self) {
        match self {
            Self::Open(task) => {
                if let Err(e) = task.execute() {
                    error!("Asynchronous store open failed: {}", e);
                }
            }
            Self::DeleteExtent { store, extent } => store.complete_extent_deletion(extent),
            Self::Batch(task) => task.execute(),
        }
    }

    fn cancel(self) {
        match self {
            Self::Open(task) => task.cancel(),
            // already removed from the known extents; drop it on disk too
            Self::DeleteExtent { store, extent } => {
                debug!(
                    "Completing cancelled deletion of extent {} in store {}",
                    extent,
                    store.id()
                );
                store.complete_extent_deletion(extent);
            }
            Self::Batch(task) => task.abort(Some(PersistenceError::persistence("batch cancelled"))),
        }
    }
}

/// A submitted unit of work; running and cancelling are mutually exclusive
/// and each happens at most once.
pub(crate) struct Task {
    id: u64,
    work: Mutex<Option<Work>>,
}

impl Task {
    fn run(&self) {
        let work = self.work.lock().take();
        if let Some(work) = work {
            work.execute();
        }
    }

    fn cancel(&self) {
        let work = self.work.lock().take();
        if let Some(work) = work {
            work.cancel();
        }
    }
}

/// Outstanding tasks, drained on release
#[derive(Default)]
struct TaskTracker {
    tasks: Mutex<HashMap<u64, Arc<Task>>>,
    drained: Condvar,
}

impl TaskTracker {
    fn complete(&self, id: u64) {
        let mut tasks = self.tasks.lock();
        tasks.remove(&id);
        if tasks.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Fixed set of worker threads fed by per-worker channels
pub(crate) struct TaskPool {
    workers: Mutex<Vec<Sender<Arc<Task>>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    tracker: Arc<TaskTracker>,
    next_id: AtomicU64,
    inline: bool,
}

impl TaskPool {
    /// Create a pool; zero threads runs every task inline
    pub(crate) fn new(name: &str, threads: usize) -> Self {
        let tracker = Arc::new(TaskTracker::default());
        let mut workers = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads {
            let (tx, rx) = unbounded::<Arc<Task>>();
            let tracker = Arc::clone(&tracker);
            let spawned = thread::Builder::new()
                .name(format!("{name}-task-{i}"))
                .spawn(move || Self::worker_loop(&rx, &tracker));
            match spawned {
                Ok(handle) => {
                    workers.push(tx);
                    handles.push(handle);
                }
                Err(e) => warn!("Failed to spawn persistence task thread: {}", e),
            }
        }

        Self {
            inline: workers.is_empty(),
            workers: Mutex::new(workers),
            handles: Mutex::new(handles),
            tracker,
            next_id: AtomicU64::new(1),
        }
    }

    fn worker_loop(rx: &Receiver<Arc<Task>>, tracker: &TaskTracker) {
        for task in rx {
            task.run();
            tracker.complete(task.id);
        }
    }

    /// Submit work keyed by its association
    pub(crate) fn submit(&self, association: &str, work: Work) {
        if self.inline {
            work.execute();
            return;
        }

        let task = Arc::new(Task {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            work: Mutex::new(Some(work)),
        });

        let sent = {
            let workers = self.workers.lock();
            if workers.is_empty() {
                false
            } else {
                self.tracker.tasks.lock().insert(task.id, Arc::clone(&task));
                let index = usize::try_from(xxh64(association.as_bytes(), 0) % workers.len() as u64)
                    .unwrap_or_default();
                workers[index].send(Arc::clone(&task)).is_ok()
            }
        };

        if !sent {
            self.tracker.complete(task.id);
            debug!("Task pool shut down; cancelling task for {}", association);
            task.cancel();
        }
    }

    /// Number of submitted tasks that have neither run nor been cancelled
    pub(crate) fn outstanding(&self) -> usize {
        self.tracker.tasks.lock().len()
    }

    /// Wait up to `grace` for outstanding tasks to finish, in `slice` steps.
    /// Returns true when the pool drained.
    pub(crate) fn await_drained(&self, grace: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut tasks = self.tracker.tasks.lock();
        while !tasks.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.tracker
                .drained
                .wait_for(&mut tasks, slice.min(deadline - now));
        }
        true
    }

    /// Cancel every outstanding task, returning how many were cancelled
    pub(crate) fn cancel_outstanding(&self) -> usize {
        let tasks: Vec<Arc<Task>> = self.tracker.tasks.lock().values().cloned().collect();
        for task in &tasks {
            task.cancel();
            self.tracker.complete(task.id);
        }
        tasks.len()
    }

    /// Stop accepting work and join the workers
    pub(crate) fn shutdown(&self) {
        self.workers.lock().clear();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Persistence task thread panicked");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.workers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_channel_collector_reports_dropped_receiver() {
        let (tx, rx) = unbounded::<Completion>();
        tx.add(Completion::Done(Receipt::from("a"))).unwrap();
        assert!(rx.recv().unwrap().is_done());

        drop(rx);
        assert!(tx.add(Completion::Done(Receipt::from("b"))).is_err());
        // logged, not raised
        notify_collector(&tx, Completion::Done(Receipt::from("c")));
    }

    #[test]
    fn test_idle_pool_drains_immediately() {
        let pool = TaskPool::new("test", 2);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.await_drained(Duration::from_millis(10), Duration::from_millis(5)));
        assert_eq!(pool.cancel_outstanding(), 0);
        pool.shutdown();
    }
}
