//! Dispatcher loop and its handle

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::messages::{DispatchRequest, Selection, Snapshot};
use crate::metrics::{Counter, MetricsSink};
use crate::state::{StoreError, StoreManager, StoreResponse};

/// State owned by the dispatcher loop
pub struct Dispatcher {
    store: StoreManager,
    metrics: Arc<dyn MetricsSink>,
    refresh_interval: Duration,
    snapshot: Snapshot,
    cursor: usize,
    rng: StdRng,
    rx: mpsc::Receiver<DispatchRequest>,
}

impl Dispatcher {
    /// Spawn the dispatcher loop, seeding its RNG from the OS
    pub fn spawn(store: StoreManager, metrics: Arc<dyn MetricsSink>, refresh_interval: Duration) -> DispatcherHandle {
        Self::spawn_with_rng(store, metrics, refresh_interval, StdRng::from_os_rng())
    }

    /// Spawn the dispatcher loop with a caller-provided RNG
    pub fn spawn_with_rng(
        store: StoreManager,
        metrics: Arc<dyn MetricsSink>,
        refresh_interval: Duration,
        rng: StdRng,
    ) -> DispatcherHandle {
        debug!(?refresh_interval, "Dispatcher::spawn_with_rng: called");
        let (tx, rx) = mpsc::channel(256);
        let dispatcher = Self {
            store,
            metrics: metrics.clone(),
            refresh_interval,
            snapshot: Snapshot::default(),
            cursor: 0,
            rng,
            rx,
        };
        tokio::spawn(dispatcher.run());
        info!("Dispatcher spawned");
        DispatcherHandle { tx, metrics }
    }

    /// Advance the cursor one group and pick a task uniformly within it
    fn select(&mut self) -> Option<Selection> {
        let groups = &self.snapshot.groups;
        if groups.is_empty() {
            debug!("select: no groups");
            return None;
        }
        self.cursor = (self.cursor + 1) % groups.len();
        let group = &groups[self.cursor];
        let task = &group.tasks[self.rng.random_range(0..group.tasks.len())];
        debug!(schedule_id = group.schedule_id, task_id = task.id, "select: chosen");
        Some(Selection {
            schedule_id: group.schedule_id,
            task: task.clone(),
        })
    }

    /// Replace the snapshot from the store; on failure the old one stays
    async fn refresh(&mut self) -> StoreResponse<usize> {
        debug!("refresh: called");
        let resolved = match self.store.active_task_groups().await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.metrics.increment(Counter::RefreshError);
                warn!(error = %e, generation = self.snapshot.generation, "Refresh failed, keeping previous groups");
                return Err(e);
            }
        };

        if !resolved.empty_schedules.is_empty() {
            self.metrics
                .add(Counter::EmptyTaskGroup, resolved.empty_schedules.len() as u64);
            debug!(schedules = ?resolved.empty_schedules, "refresh: schedules with no tasks skipped");
        }

        let count = resolved.groups.len();
        self.snapshot = Snapshot {
            generation: self.snapshot.generation + 1,
            groups: Arc::from(resolved.groups),
        };
        if self.cursor >= count {
            self.cursor = 0;
        }
        debug!(generation = self.snapshot.generation, groups = count, "refresh: snapshot replaced");
        Ok(count)
    }

    async fn run(mut self) {
        debug!("run: called");
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = self.rx.recv() => {
                    match req {
                        Some(DispatchRequest::Select { reply }) => {
                            let _ = reply.send(self.select());
                        }
                        Some(DispatchRequest::Refresh { reply }) => {
                            debug!("run: Refresh request");
                            let result = self.refresh().await;
                            let _ = reply.send(result);
                        }
                        Some(DispatchRequest::Snapshot { reply }) => {
                            let _ = reply.send(self.snapshot.clone());
                        }
                        Some(DispatchRequest::Shutdown) | None => {
                            debug!("run: shutdown");
                            info!("Dispatcher shutting down");
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }

        debug!("run: complete");
    }
}

/// Cloneable handle to the dispatcher loop
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchRequest>,
    metrics: Arc<dyn MetricsSink>,
}

impl DispatcherHandle {
    /// Ask for a task, waiting at most `timeout`
    ///
    /// A timeout or a stopped dispatcher reads as "no task available".
    pub async fn select(&self, timeout: Duration) -> Option<Selection> {
        debug!(?timeout, "select: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = async {
            self.tx.send(DispatchRequest::Select { reply: reply_tx }).await.ok()?;
            reply_rx.await.ok().flatten()
        };
        match tokio::time::timeout(timeout, request).await {
            Ok(selection) => selection,
            Err(_) => {
                self.metrics.increment(Counter::SelectionTimeout);
                warn!(?timeout, "Task selection timed out");
                None
            }
        }
    }

    /// Refresh now instead of waiting for the next tick
    pub async fn refresh(&self) -> StoreResponse<usize> {
        debug!("refresh: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatchRequest::Refresh { reply: reply_tx })
            .await
            .map_err(|_| StoreError::ChannelError)?;
        reply_rx.await.map_err(|_| StoreError::ChannelError)?
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        debug!("snapshot: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(DispatchRequest::Snapshot { reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        let _ = self.tx.send(DispatchRequest::Shutdown).await;
    }
}
