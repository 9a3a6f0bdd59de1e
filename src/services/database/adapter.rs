// Driver abstraction layer for multi-database support
use std::collections::VecDeque;

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle};

/// One row of a result set, positionally aligned with the cursor's columns.
/// `None` is SQL NULL.
pub type ResultRow = Vec<Option<String>>;

/// A pluggable adapter that knows how to open connections to one SQL backend
#[async_trait::async_trait]
pub trait SqlDriver: Send + Sync {
    /// Canonical driver name, e.g. `postgresql`
    fn name(&self) -> &str;

    /// Whether this driver can serve the given connection url
    fn accepts_url(&self, url: &str) -> bool;

    /// How composed statements must spell bound parameters for this backend
    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Open a new, unshared connection
    async fn connect(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn DbConnection>, AppError>;
}

/// A single connection, used for one statement and then closed
#[async_trait::async_trait]
pub trait DbConnection: Send {
    /// Put the session in read-only mode
    async fn set_read_only(&mut self) -> Result<(), AppError>;

    /// Execute a statement. The cursor borrows the connection, so it has to be
    /// consumed or dropped before the connection is closed.
    async fn execute<'a>(
        &'a mut self,
        query: &'a ComposedQuery,
    ) -> Result<Box<dyn ResultCursor + 'a>, AppError>;

    async fn close(self: Box<Self>) -> Result<(), AppError>;
}

/// Forward-only row stream with named columns
#[async_trait::async_trait]
pub trait ResultCursor: Send {
    fn columns(&self) -> &[String];

    /// Fetch the next row, or `None` once the result set is exhausted
    async fn next_row(&mut self) -> Result<Option<ResultRow>, AppError>;
}

/// Cursor over rows that were already fetched into memory
#[derive(Debug, Clone, Default)]
pub struct BufferedCursor {
    columns: Vec<String>,
    rows: VecDeque<ResultRow>,
}

impl BufferedCursor {
    pub fn new(columns: Vec<String>, rows: Vec<ResultRow>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

#[async_trait::async_trait]
impl ResultCursor for BufferedCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<ResultRow>, AppError> {
        Ok(self.rows.pop_front())
    }
}
