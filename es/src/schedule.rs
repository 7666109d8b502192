//! Admission of schedule definitions into the active schedule, and task-group
//! resolution of the active set

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::params::matches;
use crate::records::{ActiveScheduleEntry, TaskGroup};
use crate::store::{Store, from_millis, to_millis};

/// Round-robin position a promotion cycle resumes after
///
/// Follows promotion order: this is the most recently promoted live entry,
/// not the lowest live `(priority, schedule_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub priority: i64,
    pub schedule_id: i64,
}

/// What one promotion cycle did
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromotionReport {
    /// Most recently promoted entry before this cycle, if any was live
    pub continuation: Option<Continuation>,
    /// Entries deleted as expired or exhausted
    pub expired: usize,
    /// Schedule ids promoted, in promotion order
    pub promoted: Vec<i64>,
    /// Slots left empty for lack of eligible schedules
    pub unfilled: usize,
    /// Active entries after the cycle
    pub active: usize,
}

/// Task groups for the active set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedGroups {
    /// Non-empty groups in `(priority, schedule_id)` order
    pub groups: Vec<TaskGroup>,
    /// Active schedules that matched no task definitions
    pub empty_schedules: Vec<i64>,
}

impl Store {
    /// Run one admission cycle as a single transaction
    ///
    /// The continuation point is read first, then expired or exhausted entries
    /// are deleted, then free slots are filled from schedules sorting after the
    /// continuation point and, if slots remain, from the start of priority
    /// order. Schedules already active are never promoted again.
    pub fn promote(&mut self, now: DateTime<Utc>, concurrency_limit: usize) -> Result<PromotionReport> {
        debug!(%now, %concurrency_limit, "Store::promote: called");
        let now_ms = to_millis(now);
        let tx = self.conn.transaction()?;

        let continuation = tx
            .query_row(
                "SELECT priority, schedule_id FROM active_schedule ORDER BY promotion_seq DESC LIMIT 1",
                [],
                |row| {
                    Ok(Continuation {
                        priority: row.get(0)?,
                        schedule_id: row.get(1)?,
                    })
                },
            )
            .optional()?;

        let expired = tx.execute(
            "DELETE FROM active_schedule WHERE expiration_time <= ?1 OR measurements_remaining <= 0",
            params![now_ms],
        )?;

        let live: i64 = tx.query_row("SELECT count(*) FROM active_schedule", [], |row| row.get(0))?;
        let live = usize::try_from(live).unwrap_or(0);
        let budget = concurrency_limit.saturating_sub(live);

        let mut promoted = Vec::new();
        if budget > 0 {
            if let Some(after) = continuation {
                for id in candidates(&tx, Some(after), budget)? {
                    activate(&tx, id, now_ms)?;
                    promoted.push(id);
                }
            }
            let remaining = budget - promoted.len();
            if remaining > 0 {
                for id in candidates(&tx, None, remaining)? {
                    activate(&tx, id, now_ms)?;
                    promoted.push(id);
                }
            }
        }

        tx.commit()?;

        let report = PromotionReport {
            continuation,
            expired,
            unfilled: budget - promoted.len(),
            active: live + promoted.len(),
            promoted,
        };
        debug!(?report, "Store::promote: committed");
        Ok(report)
    }

    /// Current active entries in priority order
    pub fn list_active(&self) -> Result<Vec<ActiveScheduleEntry>> {
        debug!("Store::list_active: called");
        let mut stmt = self.conn.prepare_cached(
            "SELECT schedule_id, expiration_time, measurements_remaining, priority, scheduled_time \
             FROM active_schedule ORDER BY priority, schedule_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (schedule_id, expiration, measurements_remaining, priority, scheduled) = row?;
            entries.push(ActiveScheduleEntry {
                schedule_id,
                expiration_time: from_millis(expiration)?,
                measurements_remaining,
                priority,
                scheduled_time: from_millis(scheduled)?,
            });
        }
        Ok(entries)
    }

    /// Resolve every active entry into the tasks its predicate matches
    pub fn active_task_groups(&self) -> Result<ResolvedGroups> {
        debug!("Store::active_task_groups: called");
        let tasks = self.tasks()?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.schedule_id, a.priority, s.matching_parameters \
             FROM active_schedule a JOIN schedule_definitions s ON s.id = a.schedule_id \
             ORDER BY a.priority, a.schedule_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut resolved = ResolvedGroups::default();
        for row in rows {
            let (schedule_id, priority, predicate) = row?;
            let predicate = serde_json::from_str(&predicate)?;
            let group: Vec<_> = tasks
                .iter()
                .filter(|task| matches(&predicate, &task.parameters))
                .cloned()
                .collect();
            if group.is_empty() {
                debug!(%schedule_id, "Store::active_task_groups: no matching tasks");
                resolved.empty_schedules.push(schedule_id);
            } else {
                resolved.groups.push(TaskGroup {
                    schedule_id,
                    priority,
                    tasks: group,
                });
            }
        }
        Ok(resolved)
    }
}

/// Inactive schedule ids in priority order, optionally only those after `after`
fn candidates(tx: &Transaction<'_>, after: Option<Continuation>, limit: usize) -> Result<Vec<i64>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut ids = Vec::new();
    match after {
        Some(after) => {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM schedule_definitions \
                 WHERE (priority > ?1 OR (priority = ?1 AND id > ?2)) \
                 AND id NOT IN (SELECT schedule_id FROM active_schedule) \
                 ORDER BY priority, id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![after.priority, after.schedule_id, limit], |row| row.get(0))?;
            for row in rows {
                ids.push(row?);
            }
        }
        None => {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM schedule_definitions \
                 WHERE id NOT IN (SELECT schedule_id FROM active_schedule) \
                 ORDER BY priority, id LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| row.get(0))?;
            for row in rows {
                ids.push(row?);
            }
        }
    }
    Ok(ids)
}

fn activate(tx: &Transaction<'_>, schedule_id: i64, now_ms: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO active_schedule \
         (schedule_id, expiration_time, measurements_remaining, priority, scheduled_time, promotion_seq) \
         SELECT id, ?2 + max_duration_seconds * 1000, max_measurements, priority, ?2, \
         (SELECT COALESCE(max(promotion_seq), 0) + 1 FROM active_schedule) \
         FROM schedule_definitions WHERE id = ?1",
        params![schedule_id, now_ms],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::params::Parameters;
    use crate::records::{NewQuery, NewSchedule};

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect()
    }

    fn schedule(priority: i64, secs: u64, max_measurements: Option<i64>, task_type: &str) -> NewSchedule {
        NewSchedule {
            priority,
            max_duration: Duration::from_secs(secs),
            max_measurements,
            max_rate_per_second: None,
            matching_parameters: params(&[("taskType", task_type)]),
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_promote_from_empty_starts_at_minimum() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = store
            .write_schedules(&[schedule(2, 60, None, "img"), schedule(1, 60, None, "img")])
            .unwrap();

        let report = store.promote(t0(), 1).unwrap();
        assert_eq!(report.continuation, None);
        assert_eq!(report.promoted, vec![ids[1]]);
        assert_eq!(report.unfilled, 0);
        assert_eq!(report.active, 1);
    }

    #[test]
    fn test_promote_sets_expiration_and_budget() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = store.write_schedules(&[schedule(1, 90, Some(5), "img")]).unwrap();

        store.promote(t0(), 3).unwrap();
        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].schedule_id, ids[0]);
        assert_eq!(active[0].expiration_time, t0() + TimeDelta::seconds(90));
        assert_eq!(active[0].measurements_remaining, Some(5));
        assert_eq!(active[0].scheduled_time, t0());
    }

    #[test]
    fn test_underfill_is_reported() {
        let mut store = Store::open_in_memory().unwrap();
        store.write_schedules(&[schedule(1, 60, None, "img")]).unwrap();

        let report = store.promote(t0(), 4).unwrap();
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(report.unfilled, 3);
    }

    #[test]
    fn test_live_entry_is_not_promoted_twice() {
        let mut store = Store::open_in_memory().unwrap();
        store.write_schedules(&[schedule(1, 600, None, "img")]).unwrap();

        store.promote(t0(), 5).unwrap();
        let report = store.promote(t0() + TimeDelta::seconds(10), 5).unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(report.active, 1);
        assert_eq!(report.unfilled, 4);
    }

    #[test]
    fn test_round_robin_between_priorities() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = store
            .write_schedules(&[schedule(1, 60, None, "img"), schedule(2, 60, None, "css")])
            .unwrap();

        let first = store.promote(t0(), 1).unwrap();
        assert_eq!(first.promoted, vec![ids[0]]);

        // Still live: nothing changes
        let idle = store.promote(t0() + TimeDelta::seconds(30), 1).unwrap();
        assert!(idle.promoted.is_empty());

        let second = store.promote(t0() + TimeDelta::seconds(60), 1).unwrap();
        assert_eq!(second.expired, 1);
        assert_eq!(second.continuation.map(|c| c.schedule_id), Some(ids[0]));
        assert_eq!(second.promoted, vec![ids[1]]);

        let third = store.promote(t0() + TimeDelta::seconds(120), 1).unwrap();
        assert_eq!(third.promoted, vec![ids[0]]);
    }

    #[test]
    fn test_continuation_is_latest_promotion() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = store
            .write_schedules(&[
                schedule(1, 600, None, "img"),
                schedule(2, 60, None, "img"),
                schedule(3, 600, None, "img"),
            ])
            .unwrap();

        let first = store.promote(t0(), 2).unwrap();
        assert_eq!(first.promoted, vec![ids[0], ids[1]]);

        // The lowest live entry is ids[0], but the cycle resumes after ids[1]
        let second = store.promote(t0() + TimeDelta::seconds(60), 2).unwrap();
        assert_eq!(
            second.continuation,
            Some(Continuation {
                priority: 2,
                schedule_id: ids[1]
            })
        );
        assert_eq!(second.promoted, vec![ids[2]]);
    }

    #[test]
    fn test_exhausted_entry_is_removed() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = store.write_schedules(&[schedule(1, 600, Some(1), "img")]).unwrap();
        let task = store.write_tasks(&[params(&[("taskType", "img")])]).unwrap()[0];
        store.promote(t0(), 1).unwrap();

        store
            .write_query(&NewQuery {
                timestamp: t0(),
                remote_addr: "192.0.2.1:1".to_string(),
                raw_request: Vec::new(),
                task_id: task,
                schedule_id: Some(ids[0]),
                substrate: ".html".to_string(),
                parameters_json: "{}".to_string(),
                response_body: Vec::new(),
            })
            .unwrap();
        assert_eq!(store.list_active().unwrap()[0].measurements_remaining, Some(0));

        // Removed, then the only schedule is eligible again
        let report = store.promote(t0() + TimeDelta::seconds(1), 1).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.promoted, vec![ids[0]]);
    }

    #[test]
    fn test_resolve_groups_skips_empty_schedules() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .write_tasks(&[
                params(&[("taskType", "img"), ("url", "http://a.example/1.png")]),
                params(&[("taskType", "img"), ("url", "http://a.example/2.png")]),
                params(&[("taskType", "css")]),
            ])
            .unwrap();
        let ids = store
            .write_schedules(&[schedule(1, 60, None, "img"), schedule(1, 60, None, "iframe")])
            .unwrap();
        store.promote(t0(), 10).unwrap();

        let resolved = store.active_task_groups().unwrap();
        assert_eq!(resolved.groups.len(), 1);
        assert_eq!(resolved.groups[0].schedule_id, ids[0]);
        assert_eq!(resolved.groups[0].tasks.len(), 2);
        assert_eq!(resolved.empty_schedules, vec![ids[1]]);
    }

    #[test]
    fn test_empty_definitions_fill_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        let report = store.promote(t0(), 2).unwrap();
        assert_eq!(report, PromotionReport {
            unfilled: 2,
            ..PromotionReport::default()
        });
        assert!(store.active_task_groups().unwrap().groups.is_empty());
    }
}
