// In-memory driver used by broker and request handler tests
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle};
use crate::services::database::adapter::{
    BufferedCursor, DbConnection, ResultCursor, ResultRow, SqlDriver,
};
use crate::services::database::DriverCatalog;

#[derive(Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

/// Observable state shared by every instance the catalog hands out
#[derive(Default)]
pub struct FakeBackend {
    pub tables: Mutex<HashMap<String, FakeTable>>,
    pub unreachable_urls: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<(String, ComposedQuery)>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub read_only_sessions: AtomicUsize,
    pub refuse_read_only: AtomicBool,
    pub instances: AtomicUsize,
    /// When set, `execute` waits for a notification before answering
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub entered: Notify,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_table(&self, name: &str, columns: &[&str], rows: Vec<Vec<Option<&str>>>) {
        let table = FakeTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|cell| cell.map(str::to_string)).collect())
                .collect(),
        };
        self.tables.lock().unwrap().insert(name.to_string(), table);
    }

    pub fn mark_unreachable(&self, url: &str) {
        self.unreachable_urls.lock().unwrap().push(url.to_string());
    }

    pub fn hold_execution(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn executed(&self) -> Vec<(String, ComposedQuery)> {
        self.executed.lock().unwrap().clone()
    }

    /// Catalog exposing this backend as driver `fake` (alias `com.example.FakeDriver`)
    pub fn catalog(self: &Arc<Self>) -> DriverCatalog {
        let mut catalog = DriverCatalog::new();
        let backend = Arc::clone(self);
        catalog.register(
            "fake",
            &["com.example.FakeDriver"],
            Arc::new(move || {
                backend.instances.fetch_add(1, Ordering::SeqCst);
                Arc::new(FakeDriver {
                    backend: Arc::clone(&backend),
                }) as Arc<dyn SqlDriver>
            }),
        );
        catalog
    }
}

pub struct FakeDriver {
    backend: Arc<FakeBackend>,
}

#[async_trait::async_trait]
impl SqlDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("fake://")
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    async fn connect(
        &self,
        url: &str,
        _username: &str,
        _password: &str,
    ) -> Result<Box<dyn DbConnection>, AppError> {
        if self.backend.unreachable_urls.lock().unwrap().iter().any(|u| u == url) {
            return Err(AppError::DriverUnavailable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            backend: Arc::clone(&self.backend),
            url: url.to_string(),
        }))
    }
}

struct FakeConnection {
    backend: Arc<FakeBackend>,
    url: String,
}

#[async_trait::async_trait]
impl DbConnection for FakeConnection {
    async fn set_read_only(&mut self) -> Result<(), AppError> {
        if self.backend.refuse_read_only.load(Ordering::SeqCst) {
            return Err(AppError::StatementExecution(
                "cannot set transaction read-only mode".to_string(),
            ));
        }
        self.backend.read_only_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute<'a>(
        &'a mut self,
        query: &'a ComposedQuery,
    ) -> Result<Box<dyn ResultCursor + 'a>, AppError> {
        self.backend
            .executed
            .lock()
            .unwrap()
            .push((self.url.clone(), query.clone()));

        let gate = self.backend.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.backend.entered.notify_one();
            gate.notified().await;
        }

        // `SELECT <cols> FROM <table> ...`: the table is the word after FROM
        let table_name = query
            .sql
            .split_whitespace()
            .skip_while(|word| !word.eq_ignore_ascii_case("FROM"))
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let table = self
            .backend
            .tables
            .lock()
            .unwrap()
            .get(&table_name)
            .cloned()
            .ok_or_else(|| {
                AppError::StatementExecution(format!("relation \"{}\" does not exist", table_name))
            })?;

        Ok(Box::new(BufferedCursor::new(table.columns, table.rows)))
    }

    async fn close(self: Box<Self>) -> Result<(), AppError> {
        self.backend.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
