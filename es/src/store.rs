//! Store - the SQLite connection and record-level operations

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::params::Parameters;
use crate::records::{
    NewQuery, NewResult, NewSchedule, ParsedQuery, ParsedResult, QueryRecord, ResultRecord, ScheduleDefinition,
    TaskDefinition,
};
use crate::schema;

/// Durable store for task definitions, schedules, logs and summaries
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open: called");
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        info!(path = %path.display(), "Store opened");
        Ok(Self { conn })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Definitions ===

    /// Insert task definitions, returning their ids in input order
    pub fn write_tasks(&mut self, tasks: &[Parameters]) -> Result<Vec<i64>> {
        debug!(count = tasks.len(), "Store::write_tasks: called");
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(tasks.len());
        {
            let mut stmt = tx.prepare_cached("INSERT INTO task_definitions (parameters) VALUES (?1)")?;
            for parameters in tasks {
                stmt.execute(params![serde_json::to_string(parameters)?])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// All task definitions ordered by id
    pub fn tasks(&self) -> Result<Vec<TaskDefinition>> {
        debug!("Store::tasks: called");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, parameters FROM task_definitions ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut tasks = Vec::new();
        for row in rows {
            let (id, parameters) = row?;
            tasks.push(TaskDefinition {
                id,
                parameters: serde_json::from_str(&parameters)?,
            });
        }
        Ok(tasks)
    }

    /// Insert schedule definitions, returning their ids in input order
    pub fn write_schedules(&mut self, schedules: &[NewSchedule]) -> Result<Vec<i64>> {
        debug!(count = schedules.len(), "Store::write_schedules: called");
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(schedules.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO schedule_definitions \
                 (priority, max_duration_seconds, max_measurements, max_rate_per_second, matching_parameters) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for schedule in schedules {
                stmt.execute(params![
                    schedule.priority,
                    duration_to_secs(schedule.max_duration),
                    schedule.max_measurements,
                    schedule.max_rate_per_second,
                    serde_json::to_string(&schedule.matching_parameters)?,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// All schedule definitions in priority order
    pub fn schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        debug!("Store::schedules: called");
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, priority, max_duration_seconds, max_measurements, max_rate_per_second, matching_parameters \
             FROM schedule_definitions ORDER BY priority, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut schedules = Vec::new();
        for row in rows {
            let (id, priority, secs, max_measurements, max_rate_per_second, matching) = row?;
            schedules.push(ScheduleDefinition {
                id,
                priority,
                max_duration: secs_to_duration(secs),
                max_measurements,
                max_rate_per_second,
                matching_parameters: serde_json::from_str(&matching)?,
            });
        }
        Ok(schedules)
    }

    // === Queries ===

    /// Record a served task
    ///
    /// When the query names the schedule it was dispatched from, that
    /// schedule's remaining measurement budget is decremented in the same
    /// transaction.
    pub fn write_query(&mut self, query: &NewQuery) -> Result<i64> {
        debug!(task_id = query.task_id, schedule_id = ?query.schedule_id, "Store::write_query: called");
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO queries \
             (timestamp, remote_addr, task_id, schedule_id, raw_request, substrate, parameters_json, response_body) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                to_millis(query.timestamp),
                query.remote_addr,
                query.task_id,
                query.schedule_id,
                query.raw_request,
                query.substrate,
                query.parameters_json,
                query.response_body,
            ],
        )?;
        let id = tx.last_insert_rowid();
        if let Some(schedule_id) = query.schedule_id {
            tx.execute(
                "UPDATE active_schedule SET measurements_remaining = measurements_remaining - 1 \
                 WHERE schedule_id = ?1 AND measurements_remaining IS NOT NULL",
                params![schedule_id],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Queries without a parsed counterpart, oldest first
    pub fn unparsed_queries(&self) -> Result<Vec<QueryRecord>> {
        debug!("Store::unparsed_queries: called");
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, timestamp, remote_addr, task_id, schedule_id, raw_request, substrate, parameters_json, \
             response_body FROM queries \
             WHERE NOT EXISTS (SELECT NULL FROM parsed_queries WHERE query_id = queries.id) ORDER BY id",
        )?;
        let rows = stmt.query_map([], query_from_row)?;
        let mut queries = Vec::new();
        for row in rows {
            let (record, millis) = row?;
            queries.push(QueryRecord {
                timestamp: from_millis(millis)?,
                ..record
            });
        }
        Ok(queries)
    }

    /// Persist parsed queries, returning how many were written
    pub fn write_parsed_queries(&mut self, parsed: &[ParsedQuery]) -> Result<usize> {
        debug!(count = parsed.len(), "Store::write_parsed_queries: called");
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO parsed_queries \
                 (query_id, measurement_id, timestamp, client_ip, client_location, substrate, parameters) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for query in parsed {
                stmt.execute(params![
                    query.query_id,
                    query.measurement_id,
                    to_millis(query.timestamp),
                    query.client_ip.map(|ip| ip.to_string()),
                    query.client_location,
                    query.substrate,
                    serde_json::to_string(&query.parameters)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(parsed.len())
    }

    /// Parsed query for a query id
    pub fn parsed_query(&self, query_id: i64) -> Result<Option<ParsedQuery>> {
        debug!(%query_id, "Store::parsed_query: called");
        let mut stmt = self.conn.prepare_cached(
            "SELECT query_id, measurement_id, timestamp, client_ip, client_location, substrate, parameters \
             FROM parsed_queries WHERE query_id = ?1",
        )?;
        let mut rows = stmt.query(params![query_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let parameters: String = row.get(6)?;
        Ok(Some(ParsedQuery {
            query_id: row.get(0)?,
            measurement_id: row.get(1)?,
            timestamp: from_millis(row.get(2)?)?,
            client_ip: parse_ip(row.get(3)?),
            client_location: row.get(4)?,
            substrate: row.get(5)?,
            parameters: serde_json::from_str(&parameters)?,
        }))
    }

    // === Results ===

    /// Record a client-reported outcome
    pub fn write_result(&mut self, result: &NewResult) -> Result<i64> {
        debug!(remote_addr = %result.remote_addr, "Store::write_result: called");
        self.conn.execute(
            "INSERT INTO results (timestamp, remote_addr, raw_request) VALUES (?1, ?2, ?3)",
            params![to_millis(result.timestamp), result.remote_addr, result.raw_request],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Results without a parsed counterpart, oldest first
    pub fn unparsed_results(&self) -> Result<Vec<ResultRecord>> {
        debug!("Store::unparsed_results: called");
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, timestamp, remote_addr, raw_request FROM results \
             WHERE NOT EXISTS (SELECT NULL FROM parsed_results WHERE result_id = results.id) ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (id, millis, remote_addr, raw_request) = row?;
            results.push(ResultRecord {
                id,
                timestamp: from_millis(millis)?,
                remote_addr,
                raw_request,
            });
        }
        Ok(results)
    }

    /// Persist parsed results, returning how many were written
    pub fn write_parsed_results(&mut self, parsed: &[ParsedResult]) -> Result<usize> {
        debug!(count = parsed.len(), "Store::write_parsed_results: called");
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO parsed_results \
                 (result_id, measurement_id, timestamp, outcome, message, origin, referer, client_ip, \
                 client_location, user_agent) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for result in parsed {
                stmt.execute(params![
                    result.result_id,
                    result.measurement_id,
                    to_millis(result.timestamp),
                    result.outcome,
                    result.message,
                    result.origin,
                    result.referer,
                    result.client_ip.map(|ip| ip.to_string()),
                    result.client_location,
                    result.user_agent,
                ])?;
            }
        }
        tx.commit()?;
        Ok(parsed.len())
    }
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<(QueryRecord, i64)> {
    let millis: i64 = row.get(1)?;
    Ok((
        QueryRecord {
            id: row.get(0)?,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            remote_addr: row.get(2)?,
            task_id: row.get(3)?,
            schedule_id: row.get(4)?,
            raw_request: row.get(5)?,
            substrate: row.get(6)?,
            parameters_json: row.get(7)?,
            response_body: row.get(8)?,
        },
        millis,
    ))
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| Error::InvalidRecord(format!("timestamp {millis} out of range")))
}

pub(crate) fn duration_to_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

pub(crate) fn secs_to_duration(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

fn parse_ip(value: Option<String>) -> Option<IpAddr> {
    value.and_then(|s| s.parse().ok())
}
