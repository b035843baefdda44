//! Job Scheduler (C1): a single-consumer, per-collection-tagged FIFO of opaque
//! tasks (spec §4.1). One background worker drains the queue in enqueue order;
//! a panicking task never takes the worker down with it, and on shutdown any
//! task still sitting in the queue is discarded without running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A unit of work the scheduler runs to completion on its single worker thread.
/// Boxed so callers can enqueue arbitrary async closures, matching the spec's
/// "tasks are opaque callables".
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Envelope {
    collection: String,
    task: Task,
}

/// Handle to a running scheduler. Cloning shares the same background worker.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Envelope>,
    shutdown: Arc<Notify>,
    worker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawns the background consumer and returns a handle to enqueue work on it.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_worker = shutdown.clone();

        let worker = tokio::spawn(Self::run(rx, shutdown_for_worker));

        Self {
            tx,
            shutdown,
            worker: Arc::new(std::sync::Mutex::new(Some(worker))),
        }
    }

    /// Enqueues `task` tagged with `collection`. Tasks of different collections
    /// still serialize through the same worker (spec §4.1: "no per-collection
    /// isolation beyond the collection tag").
    pub fn add(&self, collection: impl Into<String>, task: impl Future<Output = ()> + Send + 'static) {
        let envelope = Envelope {
            collection: collection.into(),
            task: Box::pin(task),
        };
        if self.tx.send(envelope).is_err() {
            warn!("job scheduler worker has shut down; task discarded");
        }
    }

    /// Signals the worker to stop after its current task, discarding any task
    /// still queued behind it (spec §4.1: "on shutdown, any unstarted task is
    /// discarded").
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Envelope>, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    debug!("job scheduler worker received shutdown, discarding remaining queue");
                    break;
                }
                envelope = rx.recv() => {
                    match envelope {
                        Some(Envelope { collection, task }) => {
                            // A task that panics must not terminate the worker (spec §4.1);
                            // `catch_unwind` requires `UnwindSafe`, so we isolate it in its
                            // own spawned task instead and just log join errors.
                            debug!(%collection, "running scheduled task");
                            if let Err(join_err) = tokio::spawn(task).await {
                                error!(%collection, error = %join_err, "scheduled task panicked");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}
