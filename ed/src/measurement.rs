//! Measurement id generation
//!
//! A background task fills a bounded channel with fresh ids so request
//! handlers only ever wait on a channel receive.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::metrics::{Counter, MetricsSink};

/// Ids buffered ahead of demand
pub const DEFAULT_BUFFER: usize = 64;

/// Sixteen lowercase hex digits
pub fn format_measurement_id(value: u64) -> String {
    format!("{value:016x}")
}

/// Receiving side of the id generator
#[derive(Clone)]
pub struct MeasurementIds {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl MeasurementIds {
    /// Spawn a generator seeded from the OS
    pub fn spawn(metrics: Arc<dyn MetricsSink>, buffer: usize) -> Self {
        Self::spawn_with_rng(metrics, buffer, StdRng::from_os_rng())
    }

    /// Spawn a generator; it stops once every handle is dropped
    pub fn spawn_with_rng(metrics: Arc<dyn MetricsSink>, buffer: usize, mut rng: StdRng) -> Self {
        debug!(buffer, "MeasurementIds::spawn_with_rng: called");
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            loop {
                // 63 random bits
                let id = format_measurement_id(rng.random::<u64>() >> 1);
                if tx.send(id).await.is_err() {
                    debug!("measurement id generator stopped");
                    break;
                }
                metrics.increment(Counter::MeasurementIdsGenerated);
            }
        });
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next unused id
    pub async fn next(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::metrics::CounterRegistry;

    #[test]
    fn test_format_is_sixteen_hex_digits() {
        assert_eq!(format_measurement_id(0), "0000000000000000");
        assert_eq!(format_measurement_id(0xabc), "0000000000000abc");
        assert_eq!(format_measurement_id(i64::MAX as u64), "7fffffffffffffff");
    }

    #[tokio::test]
    async fn test_ids_are_distinct_and_counted() {
        let metrics = Arc::new(CounterRegistry::new());
        let ids = MeasurementIds::spawn_with_rng(metrics.clone(), 4, StdRng::seed_from_u64(1));

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = ids.next().await.unwrap();
            assert_eq!(id.len(), 16);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            // Top bit is never set
            assert!(u64::from_str_radix(&id, 16).unwrap() <= i64::MAX as u64);
            seen.insert(id);
        }
        assert_eq!(seen.len(), 100);
        assert!(metrics.get(Counter::MeasurementIdsGenerated) >= 100);
    }
}
