//! Summary tables derived from parsed results
//!
//! Each summary is dropped and recomputed wholesale from `parsed_results`,
//! restricted to the init outcome, in its own transaction.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::INIT_OUTCOME;
use crate::error::{Error, Result};
use crate::store::Store;

/// One of the derived summary tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Summary {
    PerReferer,
    PerDay,
    PerCountry,
}

impl Summary {
    pub const ALL: [Summary; 3] = [Summary::PerReferer, Summary::PerDay, Summary::PerCountry];

    pub fn table(self) -> &'static str {
        match self {
            Summary::PerReferer => "results_per_referer",
            Summary::PerDay => "results_per_day",
            Summary::PerCountry => "results_per_country",
        }
    }

    fn select(self) -> String {
        let (columns, group) = match self {
            Summary::PerReferer => ("referer", "referer"),
            Summary::PerDay => (
                "referer, date(timestamp / 1000, 'unixepoch') AS day",
                "referer, day",
            ),
            Summary::PerCountry => ("referer, client_location AS country", "referer, country"),
        };
        format!(
            "SELECT {columns}, count(*) AS results FROM parsed_results \
             WHERE outcome = '{INIT_OUTCOME}' GROUP BY {group}"
        )
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Outcome of rebuilding one summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryOutcome {
    Rebuilt { summary: Summary, rows: usize },
    Failed { summary: Summary, error: String },
}

impl SummaryOutcome {
    pub fn summary(&self) -> Summary {
        match self {
            SummaryOutcome::Rebuilt { summary, .. } | SummaryOutcome::Failed { summary, .. } => *summary,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SummaryOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RebuildReport {
    pub outcomes: Vec<SummaryOutcome>,
}

impl RebuildReport {
    pub fn failures(&self) -> impl Iterator<Item = &SummaryOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }
}

impl Store {
    /// Rebuild all three summaries; one failing does not stop the others
    pub fn rebuild_summaries(&mut self) -> RebuildReport {
        debug!("Store::rebuild_summaries: called");
        let outcomes = Summary::ALL
            .into_iter()
            .map(|summary| match self.rebuild_summary(summary) {
                Ok(rows) => SummaryOutcome::Rebuilt { summary, rows },
                Err(e) => {
                    warn!(%summary, error = %e, "Summary rebuild failed");
                    SummaryOutcome::Failed {
                        summary,
                        error: e.to_string(),
                    }
                }
            })
            .collect();
        RebuildReport { outcomes }
    }

    /// Drop and recompute one summary, returning its row count
    pub fn rebuild_summary(&mut self, summary: Summary) -> Result<usize> {
        debug!(%summary, "Store::rebuild_summary: called");
        let table = summary.table();
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; \
             CREATE TABLE {table} AS {select}; \
             CREATE INDEX {table}_referer ON {table} (referer);",
            select = summary.select(),
        ))?;
        let rows: i64 = tx.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))?;
        tx.commit()?;
        Ok(usize::try_from(rows).unwrap_or(0))
    }

    /// Init results recorded for a referer; zero when none
    pub fn count_results(&self, referer: &str) -> Result<i64> {
        debug!(%referer, "Store::count_results: called");
        let count = self
            .conn
            .query_row(
                "SELECT results FROM results_per_referer WHERE referer = ?1",
                params![referer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Init results for a referer broken down by UTC day
    pub fn results_per_day(&self, referer: &str) -> Result<BTreeMap<NaiveDate, i64>> {
        debug!(%referer, "Store::results_per_day: called");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT day, results FROM results_per_day WHERE referer = ?1")?;
        let rows = stmt.query_map(params![referer], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut days = BTreeMap::new();
        for row in rows {
            let (day, count) = row?;
            let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| Error::InvalidRecord(format!("day {day:?}: {e}")))?;
            days.insert(day, count);
        }
        Ok(days)
    }

    /// Init results for a referer broken down by client country
    pub fn results_per_country(&self, referer: &str) -> Result<BTreeMap<String, i64>> {
        debug!(%referer, "Store::results_per_country: called");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT country, results FROM results_per_country WHERE referer = ?1")?;
        let rows = stmt.query_map(params![referer], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut countries = BTreeMap::new();
        for row in rows {
            let (country, count) = row?;
            countries.insert(country, count);
        }
        Ok(countries)
    }

    #[cfg(test)]
    fn summary_rows(&self, summary: Summary) -> Vec<String> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY 1, 2", summary.table()))
            .unwrap();
        let columns = stmt.column_count();
        stmt.query_map([], |row| {
            let mut line = Vec::new();
            for i in 0..columns {
                line.push(format!("{:?}", row.get_ref(i)?));
            }
            Ok(line.join("|"))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
    }
}
