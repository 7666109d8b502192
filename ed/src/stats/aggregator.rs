//! Stats aggregation loop
//!
//! Each cycle parses newly recorded queries and results, then rebuilds the
//! three summary tables.

use std::sync::Arc;
use std::time::Duration;

use encorestore::RebuildReport;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::geo::Geolocator;
use crate::metrics::{Counter, MetricsSink};
use crate::parser::{ParseReport, parse_pending};
use crate::state::{StoreError, StoreManager, StoreResponse};

/// Aggregation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Seconds between aggregation cycles
    #[serde(rename = "rebuild-interval-secs", default = "default_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,
}

fn default_rebuild_interval_secs() -> u64 {
    300
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_secs: default_rebuild_interval_secs(),
        }
    }
}

impl StatsConfig {
    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub parse: ParseReport,
    pub rebuild: RebuildReport,
}

pub struct Aggregator {
    config: StatsConfig,
    store: StoreManager,
    geolocator: Arc<dyn Geolocator>,
    metrics: Arc<dyn MetricsSink>,
}

impl Aggregator {
    pub fn new(
        config: StatsConfig,
        store: StoreManager,
        geolocator: Arc<dyn Geolocator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        debug!(?config, "Aggregator::new: called");
        Self {
            config,
            store,
            geolocator,
            metrics,
        }
    }

    /// Parse pending rows, then rebuild every summary
    ///
    /// A failed parsing pass is logged and the rebuild still runs over what
    /// was parsed before.
    pub async fn run_cycle(&self) -> StoreResponse<AggregationReport> {
        debug!("run_cycle: called");
        let parse = match parse_pending(&self.store, self.geolocator.as_ref(), self.metrics.as_ref()).await {
            Ok(report) => report,
            Err(e @ StoreError::Fatal(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Parsing pass failed");
                ParseReport::default()
            }
        };

        let rebuild = self.store.rebuild_summaries().await?;
        let failures = rebuild.failures().count();
        if failures > 0 {
            self.metrics.add(Counter::SummaryRebuildError, failures as u64);
        }
        info!(?parse, failures, "Aggregation cycle complete");
        Ok(AggregationReport { parse, rebuild })
    }

    /// Run cycles on the configured interval until shutdown
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), StoreError> {
        debug!("run: called");
        info!(interval_secs = self.config.rebuild_interval_secs, "Aggregator starting");

        let mut interval = tokio::time::interval(self.config.rebuild_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(_) => {}
                        Err(StoreError::Fatal(e)) => {
                            error!(error = %e, "Aggregator stopping on fatal store error");
                            return Err(StoreError::Fatal(e));
                        }
                        Err(e) => warn!(error = %e, "Aggregation cycle failed"),
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("run: shutdown signal received");
                    info!("Aggregator shutting down");
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
    use chrono::Utc;
    use encorestore::{NewResult, Store};

    use super::*;
    use crate::geo::NoGeolocation;
    use crate::metrics::{CounterRegistry, NoopMetrics};

    fn submit(outcome: &str) -> NewResult {
        NewResult {
            timestamp: Utc::now(),
            remote_addr: "192.0.2.1:5555".to_string(),
            raw_request: format!(
                "GET /submit?cmh-id=1&cmh-result={outcome} HTTP/1.1\r\nReferer: http://example.com/?x=1\r\n\r\n"
            )
            .into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_cycle_makes_results_countable() {
        let store = StoreManager::with_store(Store::open_in_memory().unwrap());
        let metrics = Arc::new(CounterRegistry::new());
        let aggregator = Aggregator::new(
            StatsConfig::default(),
            store.clone(),
            Arc::new(NoGeolocation),
            metrics.clone(),
        );

        for outcome in ["init", "init", "init", "success", "failure"] {
            store.write_result(submit(outcome)).await.unwrap();
        }
        assert_eq!(store.count_results("http://example.com/").await.unwrap(), 0);

        let report = aggregator.run_cycle().await.unwrap();
        assert_eq!(report.parse.results, 5);
        assert_eq!(report.rebuild.failures().count(), 0);
        assert_eq!(store.count_results("http://example.com/").await.unwrap(), 3);
        assert_eq!(metrics.get(Counter::SummaryRebuildError), 0);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = StoreManager::with_store(Store::open_in_memory().unwrap());
        let aggregator = Aggregator::new(
            StatsConfig::default(),
            store.clone(),
            Arc::new(NoGeolocation),
            Arc::new(NoopMetrics),
        );
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { aggregator.run(shutdown_rx).await });
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        store.shutdown().await.unwrap();
    }
}
