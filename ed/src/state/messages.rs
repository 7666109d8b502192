//! Store actor messages
//!
//! Commands and responses for the actor pattern.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use encorestore::{
    ActiveScheduleEntry, NewQuery, NewResult, NewSchedule, Parameters, ParsedQuery, ParsedResult, PromotionReport,
    QueryRecord, RebuildReport, ResolvedGroups, ResultRecord, ScheduleDefinition, TaskDefinition,
};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from store operations, reported in-band
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Store(String),

    /// The connection is gone; the actor stops after replying
    #[error("Fatal store error: {0}")]
    Fatal(String),

    #[error("Channel error")]
    ChannelError,
}

impl From<encorestore::Error> for StoreError {
    fn from(e: encorestore::Error) -> Self {
        if e.is_fatal() {
            Self::Fatal(e.to_string())
        } else {
            Self::Store(e.to_string())
        }
    }
}

/// Response from store operations
pub type StoreResponse<T> = Result<T, StoreError>;

/// Commands sent to the StoreManager actor
#[derive(Debug)]
pub enum StoreCommand {
    // Definitions
    WriteTasks {
        tasks: Vec<Parameters>,
        reply: oneshot::Sender<StoreResponse<Vec<i64>>>,
    },
    WriteSchedules {
        schedules: Vec<NewSchedule>,
        reply: oneshot::Sender<StoreResponse<Vec<i64>>>,
    },
    ListTasks {
        reply: oneshot::Sender<StoreResponse<Vec<TaskDefinition>>>,
    },
    ListSchedules {
        reply: oneshot::Sender<StoreResponse<Vec<ScheduleDefinition>>>,
    },

    // Logs
    WriteQuery {
        query: NewQuery,
        reply: oneshot::Sender<StoreResponse<i64>>,
    },
    WriteResult {
        result: NewResult,
        reply: oneshot::Sender<StoreResponse<i64>>,
    },
    UnparsedQueries {
        reply: oneshot::Sender<StoreResponse<Vec<QueryRecord>>>,
    },
    UnparsedResults {
        reply: oneshot::Sender<StoreResponse<Vec<ResultRecord>>>,
    },
    WriteParsedQueries {
        parsed: Vec<ParsedQuery>,
        reply: oneshot::Sender<StoreResponse<usize>>,
    },
    WriteParsedResults {
        parsed: Vec<ParsedResult>,
        reply: oneshot::Sender<StoreResponse<usize>>,
    },

    // Summaries
    CountResults {
        referer: String,
        reply: oneshot::Sender<StoreResponse<i64>>,
    },
    ResultsPerDay {
        referer: String,
        reply: oneshot::Sender<StoreResponse<BTreeMap<NaiveDate, i64>>>,
    },
    ResultsPerCountry {
        referer: String,
        reply: oneshot::Sender<StoreResponse<BTreeMap<String, i64>>>,
    },
    RebuildSummaries {
        reply: oneshot::Sender<StoreResponse<RebuildReport>>,
    },

    // Scheduling
    Promote {
        now: DateTime<Utc>,
        concurrency_limit: usize,
        reply: oneshot::Sender<StoreResponse<PromotionReport>>,
    },
    ActiveTaskGroups {
        reply: oneshot::Sender<StoreResponse<ResolvedGroups>>,
    },
    ListActive {
        reply: oneshot::Sender<StoreResponse<Vec<ActiveScheduleEntry>>>,
    },

    // Shutdown
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_record_is_not_fatal() {
        let invalid = encorestore::Error::InvalidRecord("bad".to_string());
        assert_eq!(
            StoreError::from(invalid),
            StoreError::Store("Invalid record: bad".to_string())
        );
    }
}
