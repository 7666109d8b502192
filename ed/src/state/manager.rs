//! StoreManager - actor that owns the Store
//!
//! Processes commands via channels so that exactly one task ever touches the
//! SQLite connection.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use encorestore::{
    ActiveScheduleEntry, NewQuery, NewResult, NewSchedule, Parameters, ParsedQuery, ParsedResult, PromotionReport,
    QueryRecord, RebuildReport, ResolvedGroups, ResultRecord, ScheduleDefinition, Store, TaskDefinition,
};
use eyre::Context;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::messages::{StoreCommand, StoreError, StoreResponse};

/// Handle to send commands to the StoreManager
#[derive(Clone)]
pub struct StoreManager {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreManager {
    /// Open the database at `path` and spawn the actor
    ///
    /// Failing to open or initialize the store is a startup error.
    pub fn spawn(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "spawn: called");
        let store = Store::open(path).wrap_err_with(|| format!("Failed to open store at {}", path.display()))?;
        Ok(Self::with_store(store))
    }

    /// Spawn the actor around an already opened store
    pub fn with_store(store: Store) -> Self {
        debug!("with_store: called");
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StoreManager spawned");
        Self { tx }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<StoreResponse<T>>) -> StoreCommand) -> StoreResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| StoreError::ChannelError)?;
        reply_rx.await.map_err(|_| StoreError::ChannelError)?
    }

    // === Definitions ===

    pub async fn write_tasks(&self, tasks: Vec<Parameters>) -> StoreResponse<Vec<i64>> {
        debug!(count = tasks.len(), "write_tasks: called");
        self.call(|reply| StoreCommand::WriteTasks { tasks, reply }).await
    }

    pub async fn write_schedules(&self, schedules: Vec<NewSchedule>) -> StoreResponse<Vec<i64>> {
        debug!(count = schedules.len(), "write_schedules: called");
        self.call(|reply| StoreCommand::WriteSchedules { schedules, reply })
            .await
    }

    pub async fn list_tasks(&self) -> StoreResponse<Vec<TaskDefinition>> {
        debug!("list_tasks: called");
        self.call(|reply| StoreCommand::ListTasks { reply }).await
    }

    pub async fn list_schedules(&self) -> StoreResponse<Vec<ScheduleDefinition>> {
        debug!("list_schedules: called");
        self.call(|reply| StoreCommand::ListSchedules { reply }).await
    }

    // === Logs ===

    /// Record a served task, consuming one measurement of its schedule
    pub async fn write_query(&self, query: NewQuery) -> StoreResponse<i64> {
        debug!(task_id = query.task_id, "write_query: called");
        self.call(|reply| StoreCommand::WriteQuery { query, reply }).await
    }

    pub async fn write_result(&self, result: NewResult) -> StoreResponse<i64> {
        debug!("write_result: called");
        self.call(|reply| StoreCommand::WriteResult { result, reply }).await
    }

    pub async fn unparsed_queries(&self) -> StoreResponse<Vec<QueryRecord>> {
        debug!("unparsed_queries: called");
        self.call(|reply| StoreCommand::UnparsedQueries { reply }).await
    }

    pub async fn unparsed_results(&self) -> StoreResponse<Vec<ResultRecord>> {
        debug!("unparsed_results: called");
        self.call(|reply| StoreCommand::UnparsedResults { reply }).await
    }

    pub async fn write_parsed_queries(&self, parsed: Vec<ParsedQuery>) -> StoreResponse<usize> {
        debug!(count = parsed.len(), "write_parsed_queries: called");
        self.call(|reply| StoreCommand::WriteParsedQueries { parsed, reply })
            .await
    }

    pub async fn write_parsed_results(&self, parsed: Vec<ParsedResult>) -> StoreResponse<usize> {
        debug!(count = parsed.len(), "write_parsed_results: called");
        self.call(|reply| StoreCommand::WriteParsedResults { parsed, reply })
            .await
    }

    // === Summaries ===

    /// Init results recorded for a referer; zero when none
    pub async fn count_results(&self, referer: &str) -> StoreResponse<i64> {
        debug!(%referer, "count_results: called");
        let referer = referer.to_string();
        self.call(|reply| StoreCommand::CountResults { referer, reply }).await
    }

    pub async fn results_per_day(&self, referer: &str) -> StoreResponse<BTreeMap<NaiveDate, i64>> {
        debug!(%referer, "results_per_day: called");
        let referer = referer.to_string();
        self.call(|reply| StoreCommand::ResultsPerDay { referer, reply }).await
    }

    pub async fn results_per_country(&self, referer: &str) -> StoreResponse<BTreeMap<String, i64>> {
        debug!(%referer, "results_per_country: called");
        let referer = referer.to_string();
        self.call(|reply| StoreCommand::ResultsPerCountry { referer, reply })
            .await
    }

    pub async fn rebuild_summaries(&self) -> StoreResponse<RebuildReport> {
        debug!("rebuild_summaries: called");
        self.call(|reply| StoreCommand::RebuildSummaries { reply }).await
    }

    // === Scheduling ===

    /// Run one admission cycle as of `now`
    pub async fn promote(&self, now: DateTime<Utc>, concurrency_limit: usize) -> StoreResponse<PromotionReport> {
        debug!(%now, concurrency_limit, "promote: called");
        self.call(|reply| StoreCommand::Promote {
            now,
            concurrency_limit,
            reply,
        })
        .await
    }

    pub async fn active_task_groups(&self) -> StoreResponse<ResolvedGroups> {
        debug!("active_task_groups: called");
        self.call(|reply| StoreCommand::ActiveTaskGroups { reply }).await
    }

    pub async fn list_active(&self) -> StoreResponse<Vec<ActiveScheduleEntry>> {
        debug!("list_active: called");
        self.call(|reply| StoreCommand::ListActive { reply }).await
    }

    // === Lifecycle ===

    /// Ask the actor to stop after answering everything queued before this
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        debug!("shutdown: called");
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| StoreError::ChannelError)
    }

    /// Resolves once the actor has stopped, for any reason
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Send `result` back, reporting whether it was fatal
fn respond<T>(reply: oneshot::Sender<StoreResponse<T>>, result: encorestore::Result<T>) -> bool {
    let result = result.map_err(StoreError::from);
    let fatal = matches!(result, Err(StoreError::Fatal(_)));
    if let Err(ref e) = result {
        debug!(error = %e, "respond: store operation failed");
    }
    let _ = reply.send(result);
    fatal
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("actor_loop: called");
    debug!("StoreManager actor started");

    while let Some(cmd) = rx.recv().await {
        let fatal = match cmd {
            StoreCommand::WriteTasks { tasks, reply } => {
                debug!(count = tasks.len(), "actor_loop: WriteTasks command");
                respond(reply, store.write_tasks(&tasks))
            }

            StoreCommand::WriteSchedules { schedules, reply } => {
                debug!(count = schedules.len(), "actor_loop: WriteSchedules command");
                respond(reply, store.write_schedules(&schedules))
            }

            StoreCommand::ListTasks { reply } => {
                debug!("actor_loop: ListTasks command");
                respond(reply, store.tasks())
            }

            StoreCommand::ListSchedules { reply } => {
                debug!("actor_loop: ListSchedules command");
                respond(reply, store.schedules())
            }

            StoreCommand::WriteQuery { query, reply } => {
                debug!(task_id = query.task_id, "actor_loop: WriteQuery command");
                respond(reply, store.write_query(&query))
            }

            StoreCommand::WriteResult { result, reply } => {
                debug!("actor_loop: WriteResult command");
                respond(reply, store.write_result(&result))
            }

            StoreCommand::UnparsedQueries { reply } => {
                debug!("actor_loop: UnparsedQueries command");
                respond(reply, store.unparsed_queries())
            }

            StoreCommand::UnparsedResults { reply } => {
                debug!("actor_loop: UnparsedResults command");
                respond(reply, store.unparsed_results())
            }

            StoreCommand::WriteParsedQueries { parsed, reply } => {
                debug!(count = parsed.len(), "actor_loop: WriteParsedQueries command");
                respond(reply, store.write_parsed_queries(&parsed))
            }

            StoreCommand::WriteParsedResults { parsed, reply } => {
                debug!(count = parsed.len(), "actor_loop: WriteParsedResults command");
                respond(reply, store.write_parsed_results(&parsed))
            }

            StoreCommand::CountResults { referer, reply } => {
                debug!(%referer, "actor_loop: CountResults command");
                respond(reply, store.count_results(&referer))
            }

            StoreCommand::ResultsPerDay { referer, reply } => {
                debug!(%referer, "actor_loop: ResultsPerDay command");
                respond(reply, store.results_per_day(&referer))
            }

            StoreCommand::ResultsPerCountry { referer, reply } => {
                debug!(%referer, "actor_loop: ResultsPerCountry command");
                respond(reply, store.results_per_country(&referer))
            }

            StoreCommand::RebuildSummaries { reply } => {
                debug!("actor_loop: RebuildSummaries command");
                respond(reply, Ok(store.rebuild_summaries()))
            }

            StoreCommand::Promote {
                now,
                concurrency_limit,
                reply,
            } => {
                debug!(%now, concurrency_limit, "actor_loop: Promote command");
                respond(reply, store.promote(now, concurrency_limit))
            }

            StoreCommand::ActiveTaskGroups { reply } => {
                debug!("actor_loop: ActiveTaskGroups command");
                respond(reply, store.active_task_groups())
            }

            StoreCommand::ListActive { reply } => {
                debug!("actor_loop: ListActive command");
                respond(reply, store.list_active())
            }

            StoreCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StoreManager shutting down");
                break;
            }
        };

        if fatal {
            error!("StoreManager stopping after fatal store error");
            break;
        }
    }

    debug!("StoreManager actor stopped");
}
