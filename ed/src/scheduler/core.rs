//! Promotion loop

use std::sync::Arc;

use chrono::{DateTime, Utc};
use encorestore::PromotionReport;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use crate::metrics::{Counter, MetricsSink};
use crate::state::{StoreError, StoreManager, StoreResponse};

/// Runs admission cycles against the store actor
pub struct Scheduler {
    config: SchedulerConfig,
    store: StoreManager,
    metrics: Arc<dyn MetricsSink>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: StoreManager, metrics: Arc<dyn MetricsSink>) -> Self {
        debug!(?config, "Scheduler::new: called");
        Self { config, store, metrics }
    }

    /// Run one cycle as of now
    pub async fn run_cycle(&self) -> StoreResponse<PromotionReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> StoreResponse<PromotionReport> {
        debug!(%now, "run_cycle_at: called");
        let report = match self.store.promote(now, self.config.concurrent_groups).await {
            Ok(report) => report,
            Err(e) => {
                self.metrics.increment(Counter::PromotionError);
                warn!(error = %e, "Promotion cycle failed");
                return Err(e);
            }
        };

        if report.continuation.is_none() {
            self.metrics.increment(Counter::NoPriorGroupsScheduled);
        }
        // Counts under-filled cycles; the slot count is on the report
        if report.unfilled > 0 {
            self.metrics.increment(Counter::UnfilledSchedule);
        }
        info!(
            expired = report.expired,
            promoted = ?report.promoted,
            unfilled = report.unfilled,
            active = report.active,
            "Promotion cycle complete"
        );
        Ok(report)
    }

    /// Run cycles on the configured interval until shutdown
    ///
    /// The first cycle runs immediately. Transient failures are retried on the
    /// next tick; a fatal store error ends the loop.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), StoreError> {
        debug!("run: called");
        info!(interval_secs = self.config.interval_secs, "Scheduler starting");

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(StoreError::Fatal(e)) = self.run_cycle().await {
                        error!(error = %e, "Scheduler stopping on fatal store error");
                        return Err(StoreError::Fatal(e));
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("run: shutdown signal received");
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        debug!("run: complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use encorestore::{NewSchedule, Parameters, Store};

    use super::*;
    use crate::metrics::CounterRegistry;

    fn schedule(priority: i64, secs: u64) -> NewSchedule {
        NewSchedule {
            priority,
            max_duration: Duration::from_secs(secs),
            max_measurements: None,
            max_rate_per_second: None,
            matching_parameters: Parameters::new(),
        }
    }

    fn setup(concurrent_groups: usize) -> (Scheduler, StoreManager, Arc<CounterRegistry>) {
        let store = StoreManager::with_store(Store::open_in_memory().unwrap());
        let metrics = Arc::new(CounterRegistry::new());
        let config = SchedulerConfig {
            concurrent_groups,
            ..Default::default()
        };
        (Scheduler::new(config, store.clone(), metrics.clone()), store, metrics)
    }

    #[tokio::test]
    async fn test_cycle_counts_underfill_and_cold_start() {
        let (scheduler, store, metrics) = setup(3);
        store.write_schedules(vec![schedule(1, 60)]).await.unwrap();

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(metrics.get(Counter::NoPriorGroupsScheduled), 1);
        assert_eq!(report.unfilled, 2);
        assert_eq!(metrics.get(Counter::UnfilledSchedule), 1);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_underfill_counted_once_per_cycle() {
        let (scheduler, store, metrics) = setup(5);
        store
            .write_schedules(vec![schedule(1, 1), schedule(2, 1)])
            .await
            .unwrap();
        let start = Utc::now();

        for cycle in 0..3 {
            let report = scheduler
                .run_cycle_at(start + TimeDelta::seconds(2 * cycle))
                .await
                .unwrap();
            assert_eq!(report.unfilled, 3);
        }
        assert_eq!(metrics.get(Counter::UnfilledSchedule), 3);

        // A full active set is not an under-fill
        let (scheduler, store_full, metrics) = setup(1);
        store_full.write_schedules(vec![schedule(1, 60)]).await.unwrap();
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.unfilled, 0);
        assert_eq!(metrics.get(Counter::UnfilledSchedule), 0);

        store.shutdown().await.unwrap();
        store_full.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_priorities_alternate_with_limit_one() {
        let (scheduler, store, _metrics) = setup(1);
        let ids = store
            .write_schedules(vec![schedule(1, 60), schedule(2, 60)])
            .await
            .unwrap();
        let start = Utc::now();

        let mut promoted = Vec::new();
        for cycle in 0..6 {
            let report = scheduler
                .run_cycle_at(start + TimeDelta::seconds(60 * cycle))
                .await
                .unwrap();
            assert!(report.active <= 1);
            promoted.extend(report.promoted);
        }
        assert_eq!(promoted, vec![ids[0], ids[1], ids[0], ids[1], ids[0], ids[1]]);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_cycle_is_counted() {
        let (scheduler, store, metrics) = setup(1);
        store.shutdown().await.unwrap();
        store.closed().await;

        assert!(scheduler.run_cycle().await.is_err());
        assert_eq!(metrics.get(Counter::PromotionError), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, store, _metrics) = setup(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        store.shutdown().await.unwrap();
    }
}
