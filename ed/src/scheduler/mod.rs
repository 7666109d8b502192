//! Admission/promotion loop
//!
//! Periodically moves schedule definitions into the active schedule under
//! the configured concurrency limit.

mod config;
mod core;

pub use config::SchedulerConfig;
pub use core::Scheduler;
