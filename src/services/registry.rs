use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{DatabaseDefinition, MusterConfiguration};
use crate::services::database::DriverCatalog;

/// Immutable name → definition lookup built from one loaded configuration
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    databases: HashMap<String, Arc<DatabaseDefinition>>,
    order: Vec<String>,
}

impl DatabaseRegistry {
    /// Build a registry, rejecting duplicate database names
    pub fn from_config(config: &MusterConfiguration) -> Result<Self, AppError> {
        let mut databases = HashMap::with_capacity(config.databases.len());
        let mut order = Vec::with_capacity(config.databases.len());

        for definition in &config.databases {
            if definition.name.is_empty() {
                return Err(AppError::Config(
                    "database definition without a name".to_string(),
                ));
            }
            if databases
                .insert(definition.name.clone(), Arc::new(definition.clone()))
                .is_some()
            {
                return Err(AppError::Config(format!(
                    "duplicate database name `{}`",
                    definition.name
                )));
            }
            order.push(definition.name.clone());
        }

        Ok(Self { databases, order })
    }

    /// Exact, case-sensitive lookup
    pub fn lookup(&self, name: &str) -> Result<Arc<DatabaseDefinition>, AppError> {
        self.databases
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownDatabase(name.to_string()))
    }

    /// Definitions in configuration file order
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<DatabaseDefinition>> {
        self.order.iter().filter_map(|name| self.databases.get(name))
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Definitions whose driver identifier the catalog cannot resolve
    pub fn unsupported_drivers(&self, catalog: &DriverCatalog) -> Vec<(String, String)> {
        self.definitions()
            .filter(|definition| catalog.resolve(&definition.driver).is_err())
            .map(|definition| (definition.name.clone(), definition.driver.clone()))
            .collect()
    }
}

/// Where the database configuration comes from
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<MusterConfiguration, AppError>;

    /// File whose modification should trigger a reload, if any
    fn watched_path(&self) -> Option<&Path>;
}

/// JSON configuration file on disk
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> anyhow::Result<MusterConfiguration> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Couldn't open config file `{}`", self.path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Couldn't parse config file `{}`", self.path.display()))?;
        Ok(config)
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<MusterConfiguration, AppError> {
        self.read().map_err(|e| AppError::Config(format!("{:#}", e)))
    }

    fn watched_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// A fixed configuration, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    config: MusterConfiguration,
}

impl StaticConfigSource {
    pub fn new(config: MusterConfiguration) -> Self {
        Self { config }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<MusterConfiguration, AppError> {
        Ok(self.config.clone())
    }

    fn watched_path(&self) -> Option<&Path> {
        None
    }
}
