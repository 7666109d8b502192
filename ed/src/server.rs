//! Task serving
//!
//! Turns one inbound task request into a rendered measurement task, and
//! records submitted results. HTTP routing is left to the embedding server:
//! it builds a [`TaskRequest`] and writes back the [`TaskResponse`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use encorestore::{NewQuery, NewResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::dispatcher::DispatcherHandle;
use crate::measurement::MeasurementIds;
use crate::metrics::{Counter, MetricsSink};
use crate::render::{RenderError, TemplateRenderer};
use crate::state::{StoreManager, StoreResponse};
use crate::stats::normalize_referer;

/// Cookie and debug-referer prefix marking client hints
pub const HINT_PREFIX: &str = "cmh-";

/// Task server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL clients submit results to
    #[serde(rename = "server-url")]
    pub server_url: String,

    /// Directory of task templates
    #[serde(rename = "templates-path")]
    pub templates_path: String,

    /// Accept hints from the referer's query string
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            templates_path: "task-templates".to_string(),
            debug: false,
        }
    }
}

/// Output format of a served task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Substrate {
    JavaScript,
    Html,
}

impl Substrate {
    /// `.js` paths get JavaScript, everything else HTML
    pub fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("js") => Substrate::JavaScript,
            _ => Substrate::Html,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Substrate::JavaScript => ".js",
            Substrate::Html => ".html",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Substrate::JavaScript => "application/javascript",
            Substrate::Html => "text/html",
        }
    }
}

/// One inbound task request
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub referer: Option<String>,
    pub remote_addr: String,
    pub raw_request: Vec<u8>,
}

/// Client hints resolved from query parameters, cookies and, in debug mode,
/// the referer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hints(BTreeMap<String, String>);

impl Hints {
    pub fn from_request(request: &TaskRequest, debug_mode: bool) -> Self {
        let mut hints = BTreeMap::new();
        for (name, value) in &request.query {
            hints.entry(name.clone()).or_insert_with(|| value.clone());
        }
        for (name, value) in &request.cookies {
            if let Some(name) = name.strip_prefix(HINT_PREFIX) {
                hints.insert(name.to_string(), value.clone());
            }
        }
        if debug_mode && let Some(referer) = request.referer.as_deref().and_then(|r| Url::parse(r).ok()) {
            for (name, value) in referer.query_pairs() {
                if let Some(name) = name.strip_prefix(HINT_PREFIX) {
                    hints.insert(name.to_string(), value.into_owned());
                }
            }
        }
        Self(hints)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// `true` only for the literal value `true`
    pub fn is_true(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    /// `false` only for the literal value `false`
    pub fn is_false(&self, name: &str) -> bool {
        self.get(name) == Some("false")
    }
}

/// Outcome of a successful task request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResponse {
    /// The client asked not to run measurements
    OptedOut,
    Served {
        content_type: &'static str,
        body: Vec<u8>,
        task_id: i64,
        measurement_id: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServeError {
    #[error("No viable task available")]
    NoViableTask,

    #[error("Task {0} has no taskType")]
    MissingTaskType(i64),

    #[error("Measurement id generator stopped")]
    MeasurementIdUnavailable,

    #[error("Template error: {0}")]
    Template(#[from] RenderError),
}

/// Serves tasks and records results
pub struct TaskServer {
    config: ServerConfig,
    selection_timeout: Duration,
    dispatcher: DispatcherHandle,
    store: StoreManager,
    ids: MeasurementIds,
    renderer: Arc<dyn TemplateRenderer>,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskServer {
    pub fn new(
        config: ServerConfig,
        selection_timeout: Duration,
        dispatcher: DispatcherHandle,
        store: StoreManager,
        ids: MeasurementIds,
        renderer: Arc<dyn TemplateRenderer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            selection_timeout,
            dispatcher,
            store,
            ids,
            renderer,
            metrics,
        }
    }

    /// Select, render and record one task
    pub async fn serve(&self, request: TaskRequest) -> Result<TaskResponse, ServeError> {
        debug!(path = %request.path, remote_addr = %request.remote_addr, "serve: called");
        self.metrics.increment(Counter::TasksRequested);

        let substrate = Substrate::from_path(&request.path);
        let hints = Hints::from_request(&request, self.config.debug);

        if hints.is_true("disable") {
            debug!("serve: client opted out");
            self.metrics.increment(Counter::OptOut);
            return Ok(TaskResponse::OptedOut);
        }

        let Some(selection) = self.dispatcher.select(self.selection_timeout).await else {
            self.metrics.increment(Counter::NoViableTask);
            warn!("No viable task to serve");
            return Err(ServeError::NoViableTask);
        };
        let task = selection.task;

        let Some(task_type) = task.task_type().map(str::to_string) else {
            self.metrics.increment(Counter::MissingTaskType);
            warn!(task_id = task.id, "Task has no taskType");
            return Err(ServeError::MissingTaskType(task.id));
        };

        let measurement_id = self.ids.next().await.ok_or(ServeError::MeasurementIdUnavailable)?;

        let mut parameters = BTreeMap::from([
            ("serverUrl".to_string(), self.config.server_url.clone()),
            ("measurementId".to_string(), measurement_id.clone()),
            (
                "hintJQueryAlreadyLoaded".to_string(),
                hints.is_true("jQueryAlreadyLoaded").to_string(),
            ),
            ("hintShowStats".to_string(), (!hints.is_false("showStats")).to_string()),
        ]);
        if !hints.is_false("showStats") {
            let count = self.prior_results(request.referer.as_deref()).await;
            parameters.insert("count".to_string(), count.to_string());
        }
        for (name, value) in &task.parameters {
            if let Some(value) = value {
                parameters.insert(name.clone(), value.clone());
            }
        }

        let template = format!("{task_type}{}", substrate.extension());
        let body = self.renderer.render(&template, &parameters).map_err(|e| {
            self.metrics.increment(Counter::TemplateExecutionError);
            warn!(%template, error = %e, "Failed to render task");
            e
        })?;

        let query = NewQuery {
            timestamp: Utc::now(),
            remote_addr: request.remote_addr,
            raw_request: request.raw_request,
            task_id: task.id,
            schedule_id: Some(selection.schedule_id),
            substrate: substrate.extension().to_string(),
            parameters_json: serde_json::to_string(&parameters).unwrap_or_else(|_| "{}".to_string()),
            response_body: body.clone(),
        };
        if let Err(e) = self.store.write_query(query).await {
            self.metrics.increment(Counter::QueryWriteError);
            warn!(task_id = task.id, error = %e, "Failed to record served task");
        }

        self.metrics.increment(Counter::TasksServed);
        info!(task_id = task.id, schedule_id = selection.schedule_id, %measurement_id, "Task served");
        Ok(TaskResponse::Served {
            content_type: substrate.content_type(),
            body,
            task_id: task.id,
            measurement_id,
        })
    }

    /// Init results already recorded for the requesting site; zero on any gap
    async fn prior_results(&self, referer: Option<&str>) -> i64 {
        let Some(referer) = referer.filter(|r| !r.trim().is_empty()) else {
            self.metrics.increment(Counter::MissingReferer);
            return 0;
        };
        let Some(site) = normalize_referer(referer) else {
            self.metrics.increment(Counter::InvalidReferer);
            debug!(%referer, "prior_results: invalid referer");
            return 0;
        };
        match self.store.count_results(&site).await {
            Ok(count) => count,
            Err(e) => {
                self.metrics.increment(Counter::CountResultsError);
                warn!(%site, error = %e, "Failed to count prior results");
                0
            }
        }
    }

    /// Record a raw result submission
    pub async fn submit(&self, remote_addr: &str, raw_request: Vec<u8>) -> StoreResponse<i64> {
        debug!(%remote_addr, "submit: called");
        let result = NewResult {
            timestamp: Utc::now(),
            remote_addr: remote_addr.to_string(),
            raw_request,
        };
        match self.store.write_result(result).await {
            Ok(id) => {
                self.metrics.increment(Counter::ResultsSubmitted);
                Ok(id)
            }
            Err(e) => {
                self.metrics.increment(Counter::ResultWriteError);
                warn!(error = %e, "Failed to record result");
                Err(e)
            }
        }
    }
}
