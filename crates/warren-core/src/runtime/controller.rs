//! Level-triggered control loop: a watch pump feeding a work queue drained by
//! a bounded pool of workers.

use super::queue::WorkQueue;
use crate::config::ControllerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use warren_api::{LabelSelector, ObjectKey, ObjectStore, WatchEvent};

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing further until the next event.
    pub fn done() -> Self {
        Self::default()
    }

    /// Reconcile again after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Drives one kind of object toward its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Kind of the primary resource.
    fn kind(&self) -> &'static str;

    /// Reconcile the object at `key`. Must be idempotent: the object may
    /// have changed or vanished since the key was queued.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;

    /// Keys to enqueue for a store event. By default only events of the
    /// primary kind are mapped, to their own key.
    fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        if event.kind() == self.kind() {
            vec![event.object.key()]
        } else {
            Vec::new()
        }
    }
}

pub struct Controller<R> {
    reconciler: Arc<R>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    workers: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, store: Arc<dyn ObjectStore>, config: &ControllerConfig) -> Self {
        Self {
            reconciler,
            store,
            queue: Arc::new(WorkQueue::new(config.backoff_base, config.backoff_max)),
            workers: config.workers.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.reconciler.name();
        // Subscribe before the initial list so no change falls in between.
        let mut events = self.store.watch();
        self.resync().await;

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            workers.spawn(async move {
                while process_next(reconciler.as_ref(), &queue).await {}
                tracing::trace!(controller = name, worker = id, "Worker exited");
            });
        }
        tracing::info!(controller = name, workers = self.workers, "Controller started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::debug!(controller = name, "Controller received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in self.reconciler.map_event(&event) {
                            self.queue.add(key).await;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(controller = name, missed, "Watch lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!(controller = name, "Watch closed");
                        break;
                    }
                },
            }
        }

        self.queue.shutdown().await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(controller = name, error = ?e, "Worker panicked");
            }
        }
        tracing::info!(controller = name, "Controller stopped");
    }

    /// Enqueue every object of the primary kind.
    async fn resync(&self) {
        let kind = self.reconciler.kind();
        match self.store.list(kind, None, &LabelSelector::everything()).await {
            Ok(objects) => {
                tracing::debug!(controller = self.reconciler.name(), count = objects.len(), "Resync");
                for object in objects {
                    self.queue.add(object.key()).await;
                }
            }
            Err(e) => {
                tracing::error!(controller = self.reconciler.name(), kind, error = %e, "Resync failed");
            }
        }
    }
}

/// Reconcile one key. Returns `false` once the queue is shut down.
pub(crate) async fn process_next<R: Reconciler + ?Sized>(
    reconciler: &R,
    queue: &Arc<WorkQueue<ObjectKey>>,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let name = reconciler.name();
    let start = Instant::now();

    match reconciler.reconcile(&key).await {
        Ok(action) => {
            queue.forget(&key).await;
            tracing::debug!(
                controller = name,
                object = %key,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Reconciled"
            );
            if let Some(delay) = action.requeue_after() {
                queue.add_after(key.clone(), delay).await;
            }
        }
        Err(e) if e.is_conflict() => {
            tracing::debug!(controller = name, object = %key, error = %e, "Conflict, requeueing");
            queue.add(key.clone()).await;
        }
        Err(e) => {
            let delay = queue.add_rate_limited(key.clone()).await;
            tracing::warn!(
                controller = name,
                object = %key,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed"
            );
        }
    }

    queue.done(&key).await;
    true
}
