//! Engine wiring
//!
//! Builds the store actor, dispatcher, id generator and task server from a
//! [`Config`], and owns the background loops while they run.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use encorestore::Store;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, GeolocationConfig, StorageConfig};
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::geo::{Geolocator, NoGeolocation, StaticGeolocator};
use crate::measurement::{DEFAULT_BUFFER, MeasurementIds};
use crate::metrics::{CounterRegistry, MetricsSink};
use crate::render::{HandlebarsRenderer, TemplateRenderer};
use crate::scheduler::Scheduler;
use crate::server::TaskServer;
use crate::state::{StoreError, StoreManager};
use crate::stats::Aggregator;

/// Open the database file, creating its directory if needed
pub fn open_store(config: &StorageConfig) -> Result<Store> {
    debug!(database = %config.database.display(), "open_store: called");
    if let Some(parent) = config.database.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    Store::open(&config.database).wrap_err_with(|| format!("Failed to open store at {}", config.database.display()))
}

/// Static table when one is configured, otherwise no geolocation
pub fn geolocator(config: &GeolocationConfig) -> Arc<dyn Geolocator> {
    if config.countries.is_empty() {
        Arc::new(NoGeolocation)
    } else {
        Arc::new(StaticGeolocator::new(config.countries.clone()))
    }
}

type LoopHandle = (&'static str, mpsc::Sender<()>, JoinHandle<Result<(), StoreError>>);

pub struct Engine {
    config: Config,
    store: StoreManager,
    dispatcher: DispatcherHandle,
    server: Arc<TaskServer>,
    geolocator: Arc<dyn Geolocator>,
    metrics: Arc<CounterRegistry>,
    loops: Vec<LoopHandle>,
}

impl Engine {
    /// Open the configured database and templates, then build
    pub fn open(config: Config) -> Result<Self> {
        debug!("Engine::open: called");
        config.validate()?;
        let renderer = HandlebarsRenderer::from_directory(&config.server.templates_path)
            .wrap_err("Failed to load task templates")?;
        let store = open_store(&config.storage)?;

        let geolocator = geolocator(&config.geolocation);
        Ok(Self::build(config, store, Arc::new(renderer), geolocator))
    }

    /// Spawn the store actor, dispatcher and id generator around `store`
    ///
    /// Background promotion and aggregation do not run until
    /// [`Engine::start_loops`].
    pub fn build(
        config: Config,
        store: Store,
        renderer: Arc<dyn TemplateRenderer>,
        geolocator: Arc<dyn Geolocator>,
    ) -> Self {
        debug!("Engine::build: called");
        let metrics = Arc::new(CounterRegistry::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let store = StoreManager::with_store(store);
        let dispatcher = Dispatcher::spawn(store.clone(), sink.clone(), config.scheduling.interval());
        let ids = MeasurementIds::spawn(sink.clone(), DEFAULT_BUFFER);
        let server = TaskServer::new(
            config.server.clone(),
            config.scheduling.selection_timeout(),
            dispatcher.clone(),
            store.clone(),
            ids,
            renderer,
            sink,
        );

        Self {
            config,
            store,
            dispatcher,
            server: Arc::new(server),
            geolocator,
            metrics,
            loops: Vec::new(),
        }
    }

    /// Start the promotion and aggregation loops
    pub fn start_loops(&mut self) {
        debug!("Engine::start_loops: called");
        let sink: Arc<dyn MetricsSink> = self.metrics.clone();

        let scheduler = Scheduler::new(self.config.scheduling.clone(), self.store.clone(), sink.clone());
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        self.loops.push(("scheduler", tx, handle));

        let aggregator = Aggregator::new(
            self.config.stats.clone(),
            self.store.clone(),
            self.geolocator.clone(),
            sink,
        );
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { aggregator.run(rx).await });
        self.loops.push(("aggregator", tx, handle));

        info!("Engine loops started");
    }

    pub fn store(&self) -> &StoreManager {
        &self.store
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn server(&self) -> Arc<TaskServer> {
        self.server.clone()
    }

    pub fn geolocator(&self) -> Arc<dyn Geolocator> {
        self.geolocator.clone()
    }

    pub fn metrics(&self) -> &CounterRegistry {
        &self.metrics
    }

    /// Counter values by name, for logging
    pub fn metrics_snapshot(&self) -> HashMap<String, u64> {
        self.metrics
            .snapshot()
            .into_iter()
            .map(|(counter, n)| (counter.to_string(), n))
            .collect()
    }

    /// Stop loops, then the dispatcher, then the store actor
    pub async fn shutdown(self) -> Result<()> {
        debug!("Engine::shutdown: called");
        for (name, tx, handle) in self.loops {
            let _ = tx.send(()).await;
            match handle.await {
                Ok(Ok(())) => debug!(%name, "Engine::shutdown: loop stopped"),
                Ok(Err(e)) => warn!(%name, error = %e, "Loop ended with error"),
                Err(e) => warn!(%name, error = %e, "Loop task failed"),
            }
        }
        self.dispatcher.shutdown().await;
        // Already stopped if the store failed fatally
        let _ = self.store.shutdown().await;
        self.store.closed().await;
        info!("Engine stopped");
        Ok(())
    }
}
