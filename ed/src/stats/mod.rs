//! Result statistics
//!
//! The aggregator keeps the summary tables fresh; site stats assemble the
//! lookups for one referer.

mod aggregator;
mod referer;
mod site;

pub use aggregator::{AggregationReport, Aggregator, StatsConfig};
pub use referer::normalize_referer;
pub use site::{SiteStats, site_stats};
