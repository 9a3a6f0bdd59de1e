// SQLite driver backed by rusqlite. rusqlite is blocking, so every call runs on
// the blocking pool and results are buffered before they reach the encoder.
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle, SqlParam};
use crate::services::database::adapter::{
    BufferedCursor, DbConnection, ResultCursor, ResultRow, SqlDriver,
};
use crate::services::database::normalize_url;

pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    /// File path (or `:memory:`) from `sqlite:path`, `sqlite://path` or `jdbc:sqlite:path`
    pub fn database_path(url: &str) -> Option<&str> {
        let path = normalize_url(url).strip_prefix("sqlite:")?;
        let path = path.strip_prefix("//").unwrap_or(path);
        if path.is_empty() {
            None
        } else {
            Some(path)
        }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SqlDriver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn accepts_url(&self, url: &str) -> bool {
        Self::database_path(url).is_some()
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::NumberedQuestion
    }

    async fn connect(
        &self,
        url: &str,
        _username: &str,
        _password: &str,
    ) -> Result<Box<dyn DbConnection>, AppError> {
        let unavailable = |reason: String| AppError::DriverUnavailable {
            url: url.to_string(),
            reason,
        };
        let path = Self::database_path(url)
            .ok_or_else(|| unavailable("Missing SQLite database path".to_string()))?
            .to_string();

        // Never create a database that does not exist yet
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = tokio::task::spawn_blocking(move || Connection::open_with_flags(path, flags))
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnection {
    fn bind(param: &SqlParam) -> SqliteValue {
        match param {
            SqlParam::Int(v) => SqliteValue::Integer(*v),
            SqlParam::Float(v) => SqliteValue::Real(*v),
            SqlParam::Text(v) => SqliteValue::Text(v.clone()),
        }
    }

    fn run_query(conn: &Connection, query: &ComposedQuery) -> rusqlite::Result<BufferedCursor> {
        let mut statement = conn.prepare(&query.sql)?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let values = query.params.iter().map(Self::bind);
        let mut rows = statement.query(rusqlite::params_from_iter(values))?;

        let mut buffered: Vec<ResultRow> = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                cells.push(cell_to_string(row.get_ref(idx)?));
            }
            buffered.push(cells);
        }

        Ok(BufferedCursor::new(columns, buffered))
    }
}

#[async_trait::async_trait]
impl DbConnection for SqliteConnection {
    async fn set_read_only(&mut self) -> Result<(), AppError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            conn.blocking_lock().execute_batch("PRAGMA query_only = ON")
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
        Ok(())
    }

    async fn execute<'a>(
        &'a mut self,
        query: &'a ComposedQuery,
    ) -> Result<Box<dyn ResultCursor + 'a>, AppError> {
        let conn = Arc::clone(&self.conn);
        let owned = query.clone();
        let cursor = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::run_query(&conn, &owned)
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

        Ok(Box::new(cursor))
    }

    async fn close(self: Box<Self>) -> Result<(), AppError> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| AppError::ResourceRelease("SQLite connection still in use".to_string()))?
            .into_inner();
        tokio::task::spawn_blocking(move || conn.close())
            .await
            .map_err(|e| AppError::ResourceRelease(e.to_string()))?
            .map_err(|(_, e)| AppError::ResourceRelease(format!("SQLite close: {}", e)))
    }
}

fn cell_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
