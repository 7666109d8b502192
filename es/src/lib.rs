//! EncoreStore - SQLite persistence for the Encore measurement engine
//!
//! Holds the durable side of task scheduling:
//!
//! - **Definitions**: task definitions and schedule definitions
//! - **Active schedule**: which schedules are currently eligible for dispatch
//! - **Logs**: served queries and client-reported results, raw and parsed
//! - **Summaries**: per-referer, per-day and per-country result counts,
//!   rebuilt wholesale from the parsed result log
//!
//! Everything here is synchronous. A [`Store`] owns one connection and is
//! meant to be owned by exactly one actor; callers never share it.

mod error;
mod params;
mod records;
mod schedule;
mod schema;
mod store;
mod summary;

pub use error::{Error, Result};
pub use params::{Parameters, matches};
pub use records::{
    ActiveScheduleEntry, NewQuery, NewResult, NewSchedule, ParsedQuery, ParsedResult, QueryRecord, ResultRecord,
    ScheduleDefinition, TaskDefinition, TaskGroup,
};
pub use schedule::{Continuation, PromotionReport, ResolvedGroups};
pub use schema::SCHEMA_VERSION;
pub use store::Store;
pub use summary::{RebuildReport, Summary, SummaryOutcome};

/// Outcome value marking the first report a client sends for a measurement
pub const INIT_OUTCOME: &str = "init";
