//! Encore - measurement task scheduling engine
//!
//! Encore hands small measurement tasks to anonymous web clients, records
//! what it served and what the clients reported back, and keeps per-site
//! summaries of those reports.
//!
//! # Core Concepts
//!
//! - **Single store owner**: one actor owns the SQLite store; everything else
//!   talks to it through [`StoreManager`]
//! - **Promotion**: schedules enter a bounded active set in round-robin
//!   priority order and leave it when they expire or run out of measurements
//! - **Dispatch**: task requests are served from an in-memory snapshot of the
//!   active set, never from the store
//!
//! # Modules
//!
//! - [`state`] - Store actor and its request protocol
//! - [`scheduler`] - Promotion loop
//! - [`dispatcher`] - Round-robin task selection
//! - [`server`] - Task request handling and result submission
//! - [`parser`] - Parsing pass over recorded requests
//! - [`stats`] - Summary aggregation and site stats
//! - [`engine`] - Wiring of all of the above
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod definitions;
pub mod dispatcher;
pub mod engine;
pub mod geo;
pub mod measurement;
pub mod metrics;
pub mod parser;
pub mod render;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod stats;

// Re-export commonly used types
pub use config::Config;
pub use definitions::Definitions;
pub use dispatcher::{Dispatcher, DispatcherHandle, Selection, Snapshot};
pub use engine::Engine;
pub use geo::{Geolocator, NoGeolocation, StaticGeolocator};
pub use measurement::MeasurementIds;
pub use metrics::{Counter, CounterRegistry, MetricsSink, NoopMetrics};
pub use parser::{ParseReport, parse_pending};
pub use render::{HandlebarsRenderer, RenderError, TemplateRenderer};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use server::{ServeError, ServerConfig, TaskRequest, TaskResponse, TaskServer};
pub use state::{StoreCommand, StoreError, StoreManager, StoreResponse};
pub use stats::{AggregationReport, Aggregator, SiteStats, StatsConfig, site_stats};
