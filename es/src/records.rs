//! Record types stored in and returned by the store

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::Parameters;

/// One concrete, schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: i64,
    pub parameters: Parameters,
}

impl TaskDefinition {
    /// The template-selecting `taskType` parameter, if present and non-null
    pub fn task_type(&self) -> Option<&str> {
        self.parameters.get("taskType").and_then(|v| v.as_deref())
    }
}

/// A schedule definition to be inserted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub priority: i64,
    pub max_duration: Duration,
    pub max_measurements: Option<i64>,
    /// Stored but not enforced anywhere
    pub max_rate_per_second: Option<i64>,
    pub matching_parameters: Parameters,
}

/// A policy describing a class of tasks promoted together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: i64,
    pub priority: i64,
    pub max_duration: Duration,
    pub max_measurements: Option<i64>,
    pub max_rate_per_second: Option<i64>,
    pub matching_parameters: Parameters,
}

/// A schedule currently eligible for dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveScheduleEntry {
    pub schedule_id: i64,
    pub expiration_time: DateTime<Utc>,
    pub measurements_remaining: Option<i64>,
    pub priority: i64,
    pub scheduled_time: DateTime<Utc>,
}

/// The tasks matching one active schedule entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub schedule_id: i64,
    pub priority: i64,
    pub tasks: Vec<TaskDefinition>,
}

/// A served task to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuery {
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub raw_request: Vec<u8>,
    pub task_id: i64,
    /// Schedule the task was dispatched from, if known
    pub schedule_id: Option<i64>,
    pub substrate: String,
    pub parameters_json: String,
    pub response_body: Vec<u8>,
}

/// A recorded served task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub raw_request: Vec<u8>,
    pub task_id: i64,
    pub schedule_id: Option<i64>,
    pub substrate: String,
    pub parameters_json: String,
    pub response_body: Vec<u8>,
}

/// A client-reported outcome to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResult {
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub raw_request: Vec<u8>,
}

/// A recorded client-reported outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub raw_request: Vec<u8>,
}

/// Structured view of a [`QueryRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub query_id: i64,
    pub measurement_id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub client_location: String,
    pub substrate: String,
    pub parameters: Parameters,
}

/// Structured view of a [`ResultRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResult {
    pub result_id: i64,
    pub measurement_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
    pub message: String,
    pub origin: String,
    /// Query-stripped referer, the aggregation key
    pub referer: String,
    pub client_ip: Option<IpAddr>,
    pub client_location: String,
    pub user_agent: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type() {
        let mut task = TaskDefinition {
            id: 1,
            parameters: Parameters::new(),
        };
        assert_eq!(task.task_type(), None);

        task.parameters.insert("taskType".to_string(), None);
        assert_eq!(task.task_type(), None);

        task.parameters.insert("taskType".to_string(), Some("img".to_string()));
        assert_eq!(task.task_type(), Some("img"));
    }
}
