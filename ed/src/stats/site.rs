//! Per-site statistics

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::state::StoreManager;

/// Result counts for one referer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteStats {
    pub site: String,
    pub total_results: i64,
    pub results_per_day: BTreeMap<NaiveDate, i64>,
    pub results_per_country: BTreeMap<String, i64>,
}

/// Look up all three summaries for `site`
///
/// A failed lookup leaves its field zero or empty.
pub async fn site_stats(store: &StoreManager, site: &str) -> SiteStats {
    debug!(%site, "site_stats: called");
    let total_results = store.count_results(site).await.unwrap_or_else(|e| {
        warn!(%site, error = %e, "Failed to count results");
        0
    });
    let results_per_day = store.results_per_day(site).await.unwrap_or_else(|e| {
        warn!(%site, error = %e, "Failed to look up results per day");
        BTreeMap::new()
    });
    let results_per_country = store.results_per_country(site).await.unwrap_or_else(|e| {
        warn!(%site, error = %e, "Failed to look up results per country");
        BTreeMap::new()
    });
    SiteStats {
        site: site.to_string(),
        total_results,
        results_per_day,
        results_per_country,
    }
}
