// Driver implementations and the capability table that resolves driver identifiers
pub mod adapter;
pub mod mysql;
pub mod postgresql;
pub mod sqlite;

#[cfg(test)]
pub mod testing;

pub use adapter::{BufferedCursor, DbConnection, ResultCursor, ResultRow, SqlDriver};
pub use mysql::MySqlDriver;
pub use postgresql::PostgreSqlDriver;
pub use sqlite::SqliteDriver;

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::middleware::AppError;

/// Builds a fresh driver instance
pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn SqlDriver> + Send + Sync>;

#[derive(Clone)]
struct CatalogEntry {
    canonical: String,
    factory: DriverFactory,
}

/// Capability table mapping driver identifiers to driver factories.
/// Identifiers are matched case-sensitively, like class names in the
/// configuration files this service reads.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl DriverCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in PostgreSQL, MySQL and SQLite drivers and their
    /// JDBC class-name aliases
    pub fn with_builtin_drivers() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            "postgresql",
            &["postgres", "org.postgresql.Driver"],
            Arc::new(|| Arc::new(PostgreSqlDriver::new()) as Arc<dyn SqlDriver>),
        );
        catalog.register(
            "mysql",
            &[
                "mariadb",
                "com.mysql.jdbc.Driver",
                "com.mysql.cj.jdbc.Driver",
                "org.mariadb.jdbc.Driver",
            ],
            Arc::new(|| Arc::new(MySqlDriver::new()) as Arc<dyn SqlDriver>),
        );
        catalog.register(
            "sqlite",
            &["sqlite3", "org.sqlite.JDBC"],
            Arc::new(|| Arc::new(SqliteDriver::new()) as Arc<dyn SqlDriver>),
        );
        catalog
    }

    /// Register a driver factory under its canonical name and any aliases
    pub fn register(&mut self, canonical: &str, aliases: &[&str], factory: DriverFactory) {
        let entry = CatalogEntry {
            canonical: canonical.to_string(),
            factory,
        };
        self.entries.insert(canonical.to_string(), entry.clone());
        for alias in aliases {
            self.entries.insert(alias.to_string(), entry.clone());
        }
    }

    /// Canonical name for a driver identifier
    pub fn resolve(&self, driver_id: &str) -> Result<&str, AppError> {
        self.entries
            .get(driver_id)
            .map(|entry| entry.canonical.as_str())
            .ok_or_else(|| AppError::UnsupportedDriver(driver_id.to_string()))
    }

    /// Instantiate the driver for an identifier
    pub fn instantiate(&self, driver_id: &str) -> Result<Arc<dyn SqlDriver>, AppError> {
        self.entries
            .get(driver_id)
            .map(|entry| (entry.factory)())
            .ok_or_else(|| AppError::UnsupportedDriver(driver_id.to_string()))
    }
}

/// Strip the `jdbc:` prefix carried by urls from older configuration files
pub fn normalize_url(url: &str) -> &str {
    url.strip_prefix("jdbc:").unwrap_or(url)
}

/// Mask credentials in connection URL for safe logging
pub fn mask_credentials(url: &str) -> String {
    let normalized = normalize_url(url);
    if let Ok(parsed_url) = url::Url::parse(normalized) {
        let mut masked = parsed_url.clone();
        if parsed_url.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else {
        "[invalid-url]".to_string()
    }
}
