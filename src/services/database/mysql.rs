// MySQL / MariaDB driver backed by mysql_async, one connection per request
use mysql_async::prelude::*;
use mysql_async::{BinaryProtocol, Conn, Opts, OptsBuilder, Params, QueryResult, Value as MySqlValue};

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle, SqlParam};
use crate::services::database::adapter::{DbConnection, ResultCursor, ResultRow, SqlDriver};
use crate::services::database::{mask_credentials, normalize_url};

pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }

    /// mysql_async only understands the `mysql://` scheme
    fn connection_url(url: &str) -> String {
        let url = normalize_url(url);
        match url.strip_prefix("mariadb://") {
            Some(rest) => format!("mysql://{}", rest),
            None => url.to_string(),
        }
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SqlDriver for MySqlDriver {
    fn name(&self) -> &str {
        "mysql"
    }

    fn accepts_url(&self, url: &str) -> bool {
        let url = normalize_url(url);
        url.starts_with("mysql://") || url.starts_with("mariadb://")
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    async fn connect(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn DbConnection>, AppError> {
        let unavailable = |reason: String| AppError::DriverUnavailable {
            url: mask_credentials(url),
            reason,
        };

        let opts = Opts::from_url(&Self::connection_url(url))
            .map_err(|e| unavailable(format!("Invalid MySQL URL: {}", e)))?;
        let mut builder = OptsBuilder::from_opts(opts);
        if !username.is_empty() {
            builder = builder.user(Some(username));
        }
        if !password.is_empty() {
            builder = builder.pass(Some(password));
        }

        let conn = Conn::new(builder)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(Box::new(MySqlConnection { conn }))
    }
}

pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    fn params(query: &ComposedQuery) -> Params {
        if query.params.is_empty() {
            return Params::Empty;
        }
        Params::Positional(
            query
                .params
                .iter()
                .map(|param| match param {
                    SqlParam::Int(v) => MySqlValue::Int(*v),
                    SqlParam::Float(v) => MySqlValue::Double(*v),
                    SqlParam::Text(v) => MySqlValue::Bytes(v.clone().into_bytes()),
                })
                .collect(),
        )
    }
}

#[async_trait::async_trait]
impl DbConnection for MySqlConnection {
    async fn set_read_only(&mut self) -> Result<(), AppError> {
        self.conn
            .query_drop("SET SESSION TRANSACTION READ ONLY")
            .await?;
        Ok(())
    }

    async fn execute<'a>(
        &'a mut self,
        query: &'a ComposedQuery,
    ) -> Result<Box<dyn ResultCursor + 'a>, AppError> {
        let result = self
            .conn
            .exec_iter(query.sql.as_str(), Self::params(query))
            .await?;

        let columns = result
            .columns()
            .map(|columns| {
                columns
                    .iter()
                    .map(|column| column.name_str().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::new(MySqlCursor { columns, result }))
    }

    async fn close(self: Box<Self>) -> Result<(), AppError> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| AppError::ResourceRelease(format!("MySQL disconnect: {}", e)))
    }
}

struct MySqlCursor<'a> {
    columns: Vec<String>,
    result: QueryResult<'a, 'static, BinaryProtocol>,
}

#[async_trait::async_trait]
impl<'a> ResultCursor for MySqlCursor<'a> {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<ResultRow>, AppError> {
        let row = match self.result.next().await? {
            Some(row) => row,
            None => return Ok(None),
        };

        let cells = (0..self.columns.len())
            .map(|idx| match row.get_opt::<MySqlValue, usize>(idx) {
                Some(Ok(value)) => value_to_string(value),
                Some(Err(_)) | None => None,
            })
            .collect();
        Ok(Some(cells))
    }
}

fn value_to_string(value: MySqlValue) -> Option<String> {
    match value {
        MySqlValue::NULL => None,
        MySqlValue::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        MySqlValue::Int(i) => Some(i.to_string()),
        MySqlValue::UInt(u) => Some(u.to_string()),
        MySqlValue::Float(f) => Some(f.to_string()),
        MySqlValue::Double(d) => Some(d.to_string()),
        MySqlValue::Date(y, m, d, 0, 0, 0, 0) => Some(format!("{:04}-{:02}-{:02}", y, m, d)),
        MySqlValue::Date(y, m, d, h, min, s, 0) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            y, m, d, h, min, s
        )),
        MySqlValue::Date(y, m, d, h, min, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, m, d, h, min, s, us
        )),
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if is_neg { "-" } else { "" };
            let total_hours = d * 24 + h as u32;
            Some(format!("{}{:02}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}
