//! Counters reported by engine components
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction and report
//! events through it. [`CounterRegistry`] is the in-process implementation
//! used by the binary and by tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

/// Every event the engine counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Counter {
    // Task serving
    TasksRequested,
    TasksServed,
    OptOut,
    NoViableTask,
    MissingTaskType,
    TemplateExecutionError,
    QueryWriteError,
    MissingReferer,
    InvalidReferer,
    CountResultsError,
    ResultsSubmitted,
    ResultWriteError,

    // Scheduling and dispatch
    PromotionError,
    UnfilledSchedule,
    NoPriorGroupsScheduled,
    EmptyTaskGroup,
    RefreshError,
    SelectionTimeout,

    // Measurement ids
    MeasurementIdsGenerated,

    // Parsing and aggregation
    ParseError,
    SummaryRebuildError,
}

impl Counter {
    pub const ALL: [Counter; 21] = [
        Counter::TasksRequested,
        Counter::TasksServed,
        Counter::OptOut,
        Counter::NoViableTask,
        Counter::MissingTaskType,
        Counter::TemplateExecutionError,
        Counter::QueryWriteError,
        Counter::MissingReferer,
        Counter::InvalidReferer,
        Counter::CountResultsError,
        Counter::ResultsSubmitted,
        Counter::ResultWriteError,
        Counter::PromotionError,
        Counter::UnfilledSchedule,
        Counter::NoPriorGroupsScheduled,
        Counter::EmptyTaskGroup,
        Counter::RefreshError,
        Counter::SelectionTimeout,
        Counter::MeasurementIdsGenerated,
        Counter::ParseError,
        Counter::SummaryRebuildError,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Destination for counter events
pub trait MetricsSink: Send + Sync {
    fn add(&self, counter: Counter, n: u64);

    fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }
}

/// Lock-free counter table
#[derive(Debug)]
pub struct CounterRegistry {
    counts: [AtomicU64; Counter::ALL.len()],
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    /// Non-zero counters by name
    pub fn snapshot(&self) -> BTreeMap<Counter, u64> {
        Counter::ALL
            .into_iter()
            .map(|c| (c, self.get(c)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

impl MetricsSink for CounterRegistry {
    fn add(&self, counter: Counter, n: u64) {
        debug!(%counter, n, "CounterRegistry::add: called");
        self.counts[counter.index()].fetch_add(n, Ordering::Relaxed);
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn add(&self, _counter: Counter, _n: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_declaration_order() {
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), i, "{counter}");
        }
    }

    #[test]
    fn test_registry_counts() {
        let registry = CounterRegistry::new();
        registry.increment(Counter::TasksServed);
        registry.increment(Counter::TasksServed);
        registry.add(Counter::EmptyTaskGroup, 3);

        assert_eq!(registry.get(Counter::TasksServed), 2);
        assert_eq!(registry.get(Counter::EmptyTaskGroup), 3);
        assert_eq!(registry.get(Counter::OptOut), 0);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&Counter::TasksServed], 2);
    }

    #[test]
    fn test_counter_display() {
        assert_eq!(Counter::NoViableTask.to_string(), "NoViableTask");
    }
}
