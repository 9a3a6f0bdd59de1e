use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, DatabaseDefinition, RequestParameters, DEFAULT_REQUIRED_PARAMETERS};
use crate::services::database::mask_credentials;
use crate::services::driver_broker::{DriverBroker, DriverHandle};
use crate::services::query_composer::QueryComposer;
use crate::services::registry::{ConfigSource, DatabaseRegistry};
use crate::services::result_encoder::{NullEncoding, ResultEncoder};
use crate::validation::RequestValidator;

/// Which request pipeline is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Bound parameters, callback grammar check, JSON `null`, error payloads
    #[default]
    Hardened,
    /// Raw concatenation and verbatim callback, byte-compatible with older clients
    Legacy,
}

impl FromStr for ServiceMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardened" => Ok(ServiceMode::Hardened),
            "legacy" => Ok(ServiceMode::Legacy),
            other => Err(AppError::Config(format!("unknown service mode `{}`", other))),
        }
    }
}

/// Pipeline position of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Resolving,
    DriverAcquire,
    Executing,
    Encoding,
    Releasing,
    Done,
}

/// Terminal failure of one request, with the stage it happened in
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage:?}: {error}")]
pub struct RequestFailure {
    pub stage: Stage,
    pub error: AppError,
}

fn failed(stage: Stage) -> impl FnOnce(AppError) -> RequestFailure {
    move |error| RequestFailure { stage, error }
}

/// Everything a request resolves against. Replaced wholesale on reload, never
/// mutated, so a request that already holds one keeps a consistent view.
#[derive(Debug)]
pub struct Snapshot {
    pub registry: DatabaseRegistry,
    pub required_parameters: Vec<String>,
    pub reload_paths: Vec<PathBuf>,
    pub loaded_at: SystemTime,
    pub generation: u64,
}

/// Outcome of probing one configured database at startup or reload
#[derive(Debug)]
pub struct SelfTestReport {
    pub database: String,
    pub driver: String,
    pub outcome: Result<(), AppError>,
}

impl SelfTestReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub mode: ServiceMode,
    pub statement_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Hardened,
            statement_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrates validate → resolve → acquire → execute → encode → release for
/// every request, and owns the reloadable configuration snapshot.
pub struct RequestHandler {
    source: Arc<dyn ConfigSource>,
    broker: DriverBroker,
    snapshot: RwLock<Arc<Snapshot>>,
    reload_lock: tokio::sync::Mutex<()>,
    failed_reload_at: Mutex<Option<SystemTime>>,
    options: HandlerOptions,
}

impl RequestHandler {
    /// Load the configuration. Fails only if the initial configuration is unusable;
    /// call [`RequestHandler::self_test`] afterwards to probe the databases.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        broker: DriverBroker,
        options: HandlerOptions,
    ) -> Result<Self, AppError> {
        let snapshot = build_snapshot(source.as_ref(), &broker, 1)?;
        tracing::info!(
            "Loaded {} database definition(s) in {:?} mode",
            snapshot.registry.len(),
            options.mode
        );

        Ok(Self {
            source,
            broker,
            snapshot: RwLock::new(Arc::new(snapshot)),
            reload_lock: tokio::sync::Mutex::new(()),
            failed_reload_at: Mutex::new(None),
            options,
        })
    }

    pub fn mode(&self) -> ServiceMode {
        self.options.mode
    }

    pub fn broker(&self) -> &DriverBroker {
        &self.broker
    }

    /// The snapshot new requests resolve against
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn encoder(&self) -> ResultEncoder {
        match self.options.mode {
            ServiceMode::Hardened => ResultEncoder::new(NullEncoding::JsonNull),
            ServiceMode::Legacy => ResultEncoder::new(NullEncoding::EmptyString),
        }
    }

    /// Serve one request and return the complete JSONP document
    pub async fn handle(&self, params: &HashMap<String, String>) -> Result<String, RequestFailure> {
        let request_id = Uuid::new_v4();
        let database = params.get("database").map(String::as_str).unwrap_or_default();
        let span = tracing::info_span!("muster_request", %request_id, database);
        self.run_pipeline(params).instrument(span).await
    }

    async fn run_pipeline(&self, params: &HashMap<String, String>) -> Result<String, RequestFailure> {
        self.reinitialize_if_changed().await;
        let snapshot = self.snapshot();

        let result = self.resolve_and_execute(&snapshot, params).await;
        match &result {
            Ok(body) => tracing::info!(stage = ?Stage::Done, bytes = body.len(), "Request served"),
            Err(failure) => tracing::warn!(stage = ?failure.stage, "Request failed: {}", failure.error),
        }
        result
    }

    async fn resolve_and_execute(
        &self,
        snapshot: &Snapshot,
        params: &HashMap<String, String>,
    ) -> Result<String, RequestFailure> {
        RequestValidator::validate(params, &snapshot.required_parameters)
            .map_err(failed(Stage::Validating))?;
        let request = RequestParameters::from_map(params);
        if self.options.mode == ServiceMode::Hardened {
            RequestValidator::validate_callback(&request.callback)
                .map_err(failed(Stage::Validating))?;
        }

        let definition = snapshot
            .registry
            .lookup(&request.database)
            .map_err(failed(Stage::Resolving))?;

        // An early return below drops the handle, which releases it
        let handle = self
            .broker
            .acquire(&definition.driver, &definition.url)
            .map_err(failed(Stage::DriverAcquire))?;

        let query = self
            .compose(&request, &handle)
            .map_err(failed(Stage::Executing))?;
        tracing::debug!("{}", query);

        let timeout = self.options.statement_timeout;
        let body = tokio::time::timeout(
            timeout,
            self.execute(&definition, &handle, &query, &request.callback),
        )
        .await
        .map_err(|_| RequestFailure {
            stage: Stage::Executing,
            error: AppError::Timeout(timeout.as_secs()),
        })??;

        if let Err(e) = self.broker.release(handle) {
            tracing::warn!(stage = ?Stage::Releasing, "{}", e);
        }
        Ok(body)
    }

    fn compose(&self, request: &RequestParameters, handle: &DriverHandle) -> Result<ComposedQuery, AppError> {
        match self.options.mode {
            ServiceMode::Legacy => Ok(ComposedQuery::new(QueryComposer::compose_legacy(
                &request.select,
                &request.from,
                request.where_clause.as_deref(),
                request.order.as_deref(),
            ))),
            ServiceMode::Hardened => QueryComposer::compose(
                &request.select,
                &request.from,
                request.where_clause.as_deref(),
                request.order.as_deref(),
                handle.driver().placeholder_style(),
            ),
        }
    }

    /// Connect, run the statement, encode, and always close the connection
    async fn execute(
        &self,
        definition: &DatabaseDefinition,
        handle: &DriverHandle,
        query: &ComposedQuery,
        callback: &str,
    ) -> Result<String, RequestFailure> {
        let mut connection = handle
            .driver()
            .connect(&definition.url, &definition.username, &definition.password)
            .await
            .map_err(failed(Stage::Executing))?;

        let encoded = async {
            if self.options.mode == ServiceMode::Hardened {
                connection
                    .set_read_only()
                    .await
                    .map_err(failed(Stage::Executing))?;
            }
            let mut cursor = connection
                .execute(query)
                .await
                .map_err(failed(Stage::Executing))?;
            self.encoder()
                .encode(callback, cursor.as_mut())
                .await
                .map_err(failed(Stage::Encoding))
        }
        .await;

        if let Err(e) = connection.close().await {
            tracing::warn!(stage = ?Stage::Releasing, "Closing connection to `{}`: {}", definition.name, e);
        }
        encoded
    }

    /// Probe every configured database of the current snapshot
    pub async fn self_test(&self) -> Vec<SelfTestReport> {
        let snapshot = self.snapshot();
        self.probe_all(&snapshot).await
    }

    async fn probe_all(&self, snapshot: &Snapshot) -> Vec<SelfTestReport> {
        let mut reports = Vec::with_capacity(snapshot.registry.len());
        for definition in snapshot.registry.definitions() {
            let outcome = match tokio::time::timeout(
                self.options.statement_timeout,
                self.probe(definition),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(AppError::Timeout(self.options.statement_timeout.as_secs())),
            };

            match &outcome {
                Ok(()) => tracing::info!(
                    "Database `{}` ({}, {}) is reachable",
                    definition.name,
                    definition.driver,
                    mask_credentials(&definition.url)
                ),
                Err(e) => tracing::warn!(
                    "Database `{}` ({}, {}) failed its self-test: {}",
                    definition.name,
                    definition.driver,
                    mask_credentials(&definition.url),
                    e
                ),
            }
            reports.push(SelfTestReport {
                database: definition.name.clone(),
                driver: definition.driver.clone(),
                outcome,
            });
        }
        reports
    }

    async fn probe(&self, definition: &DatabaseDefinition) -> Result<(), AppError> {
        let handle = self.broker.acquire(&definition.driver, &definition.url)?;
        let mut connection = handle
            .driver()
            .connect(&definition.url, &definition.username, &definition.password)
            .await?;
        let read_only = connection.set_read_only().await;
        let closed = connection.close().await;
        self.broker.release(handle)?;
        read_only.and(closed)
    }

    /// Reload the configuration, rebuild the registry and rerun the self-test.
    /// On failure the previous snapshot stays in place.
    pub async fn reinitialize(&self) -> Result<Arc<Snapshot>, AppError> {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked().await
    }

    /// Reinitialize when a watched file changed after the last load.
    /// Returns whether a new snapshot was installed.
    pub async fn reinitialize_if_changed(&self) -> bool {
        if !self.reload_due(&self.snapshot()) {
            return false;
        }

        let _guard = self.reload_lock.lock().await;
        // Another request may have reloaded while this one waited
        if !self.reload_due(&self.snapshot()) {
            return false;
        }

        match self.reload_locked().await {
            Ok(snapshot) => {
                tracing::info!("Configuration reloaded (generation {})", snapshot.generation);
                true
            }
            Err(e) => {
                tracing::error!("Reload failed, keeping previous configuration: {}", e);
                false
            }
        }
    }

    async fn reload_locked(&self) -> Result<Arc<Snapshot>, AppError> {
        let generation = self.snapshot().generation + 1;
        let snapshot = match build_snapshot(self.source.as_ref(), &self.broker, generation) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                *self
                    .failed_reload_at
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(SystemTime::now());
                return Err(e);
            }
        };

        self.probe_all(&snapshot).await;

        let mut current = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    fn reload_due(&self, snapshot: &Snapshot) -> bool {
        let failed_at = *self
            .failed_reload_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let since = match failed_at {
            Some(failed_at) if failed_at > snapshot.loaded_at => failed_at,
            _ => snapshot.loaded_at,
        };

        snapshot.reload_paths.iter().any(|path| {
            std::fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map(|modified| modified > since)
                .unwrap_or(false)
        })
    }
}

fn build_snapshot(
    source: &dyn ConfigSource,
    broker: &DriverBroker,
    generation: u64,
) -> Result<Snapshot, AppError> {
    // Taken before reading so an edit during the load triggers another reload
    let loaded_at = SystemTime::now();
    let config = source.load()?;
    let registry = DatabaseRegistry::from_config(&config)?;

    for (name, driver) in registry.unsupported_drivers(broker.catalog()) {
        tracing::warn!("Database `{}` uses unsupported driver `{}`", name, driver);
    }

    let mut reload_paths = Vec::new();
    if let Some(path) = source.watched_path() {
        reload_paths.push(path.to_path_buf());
    }
    if let Some(marker) = config.reload_file_path.as_deref().filter(|p| !p.is_empty()) {
        reload_paths.push(resolve_marker(marker, source.watched_path()));
    }

    Ok(Snapshot {
        registry,
        required_parameters: DEFAULT_REQUIRED_PARAMETERS
            .iter()
            .map(|p| p.to_string())
            .collect(),
        reload_paths,
        loaded_at,
        generation,
    })
}

/// Relative marker paths are looked up next to the configuration file first,
/// then in the working directory
fn resolve_marker(marker: &str, config_path: Option<&Path>) -> PathBuf {
    let marker = Path::new(marker);
    if marker.is_absolute() {
        return marker.to_path_buf();
    }
    if let Some(dir) = config_path.and_then(Path::parent) {
        let beside_config = dir.join(marker);
        if beside_config.exists() {
            return beside_config;
        }
    }
    marker.to_path_buf()
}
