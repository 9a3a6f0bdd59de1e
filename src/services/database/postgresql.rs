// PostgreSQL driver backed by tokio-postgres, one connection per request
use std::error::Error;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, RowStream};

use crate::api::middleware::AppError;
use crate::models::{ComposedQuery, PlaceholderStyle, SqlParam};
use crate::services::database::adapter::{DbConnection, ResultCursor, ResultRow, SqlDriver};
use crate::services::database::{mask_credentials, normalize_url};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostgreSqlDriver;

impl PostgreSqlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgreSqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SqlDriver for PostgreSqlDriver {
    fn name(&self) -> &str {
        "postgresql"
    }

    fn accepts_url(&self, url: &str) -> bool {
        let url = normalize_url(url);
        url.starts_with("postgresql://") || url.starts_with("postgres://")
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
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

        let mut config = tokio_postgres::Config::from_str(normalize_url(url))
            .map_err(|e| unavailable(format!("Invalid PostgreSQL URL: {}", e)))?;
        if !username.is_empty() {
            config.user(username);
        }
        if !password.is_empty() {
            config.password(password);
        }
        config.connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let masked = mask_credentials(url);
        let driver_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection to {} ended with error: {}", masked, e);
            }
        });

        Ok(Box::new(PostgreSqlConnection {
            client,
            driver_task,
        }))
    }
}

pub struct PostgreSqlConnection {
    client: Client,
    driver_task: JoinHandle<()>,
}

impl PostgreSqlConnection {
    fn param_type(param: &SqlParam) -> Type {
        match param {
            SqlParam::Int(_) => Type::INT8,
            SqlParam::Float(_) => Type::FLOAT8,
            SqlParam::Text(_) => Type::TEXT,
        }
    }

    fn param_value(param: &SqlParam) -> Box<dyn ToSql + Sync + Send> {
        match param {
            SqlParam::Int(v) => Box::new(*v),
            SqlParam::Float(v) => Box::new(*v),
            SqlParam::Text(v) => Box::new(v.clone()),
        }
    }
}

#[async_trait::async_trait]
impl DbConnection for PostgreSqlConnection {
    async fn set_read_only(&mut self) -> Result<(), AppError> {
        self.client
            .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
            .await?;
        Ok(())
    }

    async fn execute<'a>(
        &'a mut self,
        query: &'a ComposedQuery,
    ) -> Result<Box<dyn ResultCursor + 'a>, AppError> {
        let types: Vec<Type> = query.params.iter().map(Self::param_type).collect();
        let statement = self.client.prepare_typed(&query.sql, &types).await?;

        let columns = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();

        let values: Vec<Box<dyn ToSql + Sync + Send>> =
            query.params.iter().map(Self::param_value).collect();
        let rows = self
            .client
            .query_raw(&statement, values.iter().map(|v| &**v as &dyn ToSql))
            .await?;

        Ok(Box::new(PostgreSqlCursor {
            columns,
            rows: Box::pin(rows),
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), AppError> {
        let PostgreSqlConnection {
            client,
            driver_task,
        } = *self;
        // The connection task finishes once its last client is gone
        drop(client);
        driver_task
            .await
            .map_err(|e| AppError::ResourceRelease(format!("PostgreSQL connection task: {}", e)))
    }
}

struct PostgreSqlCursor {
    columns: Vec<String>,
    rows: Pin<Box<RowStream>>,
}

#[async_trait::async_trait]
impl ResultCursor for PostgreSqlCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<ResultRow>, AppError> {
        match self.rows.next().await {
            Some(row) => {
                let row = row?;
                let cells = (0..row.len())
                    .map(|idx| cell_to_string(&row, idx))
                    .collect();
                Ok(Some(cells))
            }
            None => Ok(None),
        }
    }
}

/// Undecoded binary cell, so every column type reaches [`decode`]
struct RawCell<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawCell<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawCell(raw))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// String form of one cell, following the column's PostgreSQL type
fn cell_to_string(row: &Row, idx: usize) -> Option<String> {
    let column = &row.columns()[idx];
    match row.try_get::<_, Option<RawCell>>(idx) {
        Ok(cell) => cell.map(|RawCell(raw)| decode(column.type_(), raw)),
        Err(e) => {
            tracing::debug!("Reading column {}: {}", column.name(), e);
            Some(format!("<{}>", column.type_().name()))
        }
    }
}

/// Text form of a binary-format value, close to what `psql` prints
fn decode(ty: &Type, raw: &[u8]) -> String {
    fn via<'a, T>(ty: &Type, raw: &'a [u8]) -> Option<String>
    where
        T: FromSql<'a> + ToString,
    {
        T::from_sql(ty, raw).ok().map(|v| v.to_string())
    }

    let decoded = match *ty {
        Type::BOOL => via::<bool>(ty, raw),
        Type::CHAR => via::<i8>(ty, raw),
        Type::INT2 => via::<i16>(ty, raw),
        Type::INT4 => via::<i32>(ty, raw),
        Type::INT8 => via::<i64>(ty, raw),
        Type::OID => via::<u32>(ty, raw),
        Type::FLOAT4 => via::<f32>(ty, raw),
        Type::FLOAT8 => via::<f64>(ty, raw),
        Type::NUMERIC => via::<Decimal>(ty, raw).or_else(|| numeric_special(raw)),
        Type::MONEY => money(raw),
        Type::DATE => via::<chrono::NaiveDate>(ty, raw),
        Type::TIME => via::<chrono::NaiveTime>(ty, raw),
        Type::TIMETZ => timetz(raw),
        Type::TIMESTAMP => via::<chrono::NaiveDateTime>(ty, raw),
        Type::TIMESTAMPTZ => via::<chrono::DateTime<chrono::Utc>>(ty, raw),
        Type::INTERVAL => interval(raw),
        Type::UUID => via::<uuid::Uuid>(ty, raw),
        Type::JSON | Type::JSONB => via::<serde_json::Value>(ty, raw),
        Type::INET | Type::CIDR => inet(raw),
        Type::BYTEA => Some(raw.iter().fold(String::from("\\x"), |mut hex, byte| {
            hex.push_str(&format!("{:02x}", byte));
            hex
        })),
        _ => match ty.kind() {
            Kind::Array(element) => array(element, raw),
            Kind::Domain(base) => Some(decode(base, raw)),
            // text, varchar, name, enums, xml and extension text types
            _ => std::str::from_utf8(raw).ok().map(str::to_string),
        },
    };

    decoded.unwrap_or_else(|| {
        tracing::debug!("No string conversion for type {}", ty.name());
        format!("<{}>", ty.name())
    })
}

fn take<const N: usize>(buf: &mut &[u8]) -> Option<[u8; N]> {
    if buf.len() < N {
        return None;
    }
    let (head, rest) = buf.split_at(N);
    *buf = rest;
    head.try_into().ok()
}

fn take_i32(buf: &mut &[u8]) -> Option<i32> {
    take::<4>(buf).map(i32::from_be_bytes)
}

fn take_i64(buf: &mut &[u8]) -> Option<i64> {
    take::<8>(buf).map(i64::from_be_bytes)
}

/// `NaN` and the infinities, which `Decimal` cannot hold
fn numeric_special(raw: &[u8]) -> Option<String> {
    let sign = u16::from_be_bytes(raw.get(4..6)?.try_into().ok()?);
    match sign {
        0xC000 => Some("NaN".to_string()),
        0xD000 => Some("Infinity".to_string()),
        0xF000 => Some("-Infinity".to_string()),
        _ => None,
    }
}

fn money(mut raw: &[u8]) -> Option<String> {
    let cents = take_i64(&mut raw)?;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    Some(format!("{}{}.{:02}", sign, cents / 100, cents % 100))
}

/// `HH:MM:SS[.ffffff]`, with trailing zeros of the fraction trimmed
fn clock(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let micros = micros.unsigned_abs();
    let secs = micros / 1_000_000;
    let mut out = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        secs / 3600,
        secs / 60 % 60,
        secs % 60
    );
    let fraction = micros % 1_000_000;
    if fraction > 0 {
        out.push_str(format!(".{:06}", fraction).trim_end_matches('0'));
    }
    out
}

fn timetz(mut raw: &[u8]) -> Option<String> {
    let micros = take_i64(&mut raw)?;
    // Stored as seconds west of UTC
    let offset = -take_i32(&mut raw)?;
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.unsigned_abs();
    let mut out = format!("{}{}{:02}", clock(micros), sign, offset / 3600);
    if offset % 3600 != 0 {
        out.push_str(&format!(":{:02}", offset / 60 % 60));
    }
    Some(out)
}

fn interval(mut raw: &[u8]) -> Option<String> {
    let micros = take_i64(&mut raw)?;
    let days = take_i32(&mut raw)?;
    let months = take_i32(&mut raw)?;

    let unit = |n: i32, one: &str, many: &str| {
        format!("{} {}", n, if n.abs() == 1 { one } else { many })
    };
    let mut parts = Vec::new();
    if months / 12 != 0 {
        parts.push(unit(months / 12, "year", "years"));
    }
    if months % 12 != 0 {
        parts.push(unit(months % 12, "mon", "mons"));
    }
    if days != 0 {
        parts.push(unit(days, "day", "days"));
    }
    if micros != 0 || parts.is_empty() {
        parts.push(clock(micros));
    }
    Some(parts.join(" "))
}

fn inet(raw: &[u8]) -> Option<String> {
    let (family, bits, is_cidr, len) = (*raw.first()?, *raw.get(1)?, *raw.get(2)?, *raw.get(3)?);
    let addr = raw.get(4..4 + len as usize)?;
    let (ip, full) = match family {
        2 => (IpAddr::from(<[u8; 4]>::try_from(addr).ok()?), 32),
        3 => (IpAddr::from(<[u8; 16]>::try_from(addr).ok()?), 128),
        _ => return None,
    };
    if is_cidr != 0 || bits != full {
        Some(format!("{}/{}", ip, bits))
    } else {
        Some(ip.to_string())
    }
}

/// Arrays in PostgreSQL's `{a,"b c",NULL}` notation
fn array(element: &Type, mut raw: &[u8]) -> Option<String> {
    let dimensions = take_i32(&mut raw)?;
    let _has_nulls = take_i32(&mut raw)?;
    let _element_oid = take_i32(&mut raw)?;
    if dimensions <= 0 {
        return Some("{}".to_string());
    }

    let mut lengths = Vec::with_capacity(dimensions as usize);
    for _ in 0..dimensions {
        lengths.push(take_i32(&mut raw)?.max(0) as usize);
        let _lower_bound = take_i32(&mut raw)?;
    }

    let mut items = Vec::new();
    for _ in 0..lengths.iter().product::<usize>() {
        let len = take_i32(&mut raw)?;
        if len < 0 {
            items.push(None);
            continue;
        }
        let len = len as usize;
        if raw.len() < len {
            return None;
        }
        let (value, rest) = raw.split_at(len);
        items.push(Some(decode(element, value)));
        raw = rest;
    }

    let mut out = String::new();
    nest_array(&lengths, &mut items.into_iter(), &mut out);
    Some(out)
}

fn nest_array<I>(lengths: &[usize], items: &mut I, out: &mut String)
where
    I: Iterator<Item = Option<String>>,
{
    out.push('{');
    for idx in 0..lengths[0] {
        if idx > 0 {
            out.push(',');
        }
        if lengths.len() > 1 {
            nest_array(&lengths[1..], items, out);
            continue;
        }
        match items.next().flatten() {
            Some(value) => push_array_item(&value, out),
            None => out.push_str("NULL"),
        }
    }
    out.push('}');
}

fn push_array_item(value: &str, out: &mut String) {
    let quote = value.is_empty()
        || value.eq_ignore_ascii_case("NULL")
        || value
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !quote {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_postgres_urls() {
        let driver = PostgreSqlDriver::new();
        assert!(driver.accepts_url("jdbc:postgresql://localhost/db"));
        assert!(driver.accepts_url("postgres://localhost/db"));
        assert!(!driver.accepts_url("mysql://localhost/db"));
        assert_eq!(driver.placeholder_style(), PlaceholderStyle::Dollar);
    }

    #[test]
    fn test_param_types() {
        assert_eq!(PostgreSqlConnection::param_type(&SqlParam::Int(1)), Type::INT8);
        assert_eq!(PostgreSqlConnection::param_type(&SqlParam::Float(1.5)), Type::FLOAT8);
        assert_eq!(
            PostgreSqlConnection::param_type(&SqlParam::Text("x".into())),
            Type::TEXT
        );
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(&Type::INT4, &42i32.to_be_bytes()), "42");
        assert_eq!(decode(&Type::BOOL, &[1]), "true");
        assert_eq!(decode(&Type::TEXT, b"O'Brien"), "O'Brien");
        assert_eq!(decode(&Type::BYTEA, &[0xde, 0xad]), "\\xdead");
    }

    #[test]
    fn test_decode_numeric() {
        // 12.340: 2 digit groups, weight 0, positive, scale 3, groups [12, 3400]
        let raw = [0, 2, 0, 0, 0, 0, 0, 3, 0, 12, 0x0d, 0x48];
        let text = decode(&Type::NUMERIC, &raw);
        assert_eq!(text.parse::<f64>().unwrap(), 12.34);

        let nan = [0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert_eq!(decode(&Type::NUMERIC, &nan), "NaN");
    }

    #[test]
    fn test_decode_money_interval_timetz() {
        assert_eq!(decode(&Type::MONEY, &(-12345i64).to_be_bytes()), "-123.45");

        let mut interval = Vec::new();
        interval.extend_from_slice(&((4 * 3600 + 5 * 60 + 6) * 1_000_000i64).to_be_bytes());
        interval.extend_from_slice(&3i32.to_be_bytes());
        interval.extend_from_slice(&14i32.to_be_bytes());
        assert_eq!(
            decode(&Type::INTERVAL, &interval),
            "1 year 2 mons 3 days 04:05:06"
        );

        let mut timetz = Vec::new();
        timetz.extend_from_slice(&(37_800_500_000i64).to_be_bytes());
        timetz.extend_from_slice(&(-3600i32).to_be_bytes());
        assert_eq!(decode(&Type::TIMETZ, &timetz), "10:30:00.5+01");
    }

    #[test]
    fn test_decode_inet() {
        assert_eq!(decode(&Type::INET, &[2, 32, 0, 4, 10, 0, 0, 1]), "10.0.0.1");
        assert_eq!(decode(&Type::CIDR, &[2, 8, 1, 4, 10, 0, 0, 0]), "10.0.0.0/8");
    }

    #[test]
    fn test_decode_arrays() {
        let mut ints = Vec::new();
        for word in [1i32, 1, 23, 3, 1] {
            ints.extend_from_slice(&word.to_be_bytes());
        }
        ints.extend_from_slice(&4i32.to_be_bytes());
        ints.extend_from_slice(&1i32.to_be_bytes());
        ints.extend_from_slice(&(-1i32).to_be_bytes());
        ints.extend_from_slice(&4i32.to_be_bytes());
        ints.extend_from_slice(&3i32.to_be_bytes());
        assert_eq!(decode(&Type::INT4_ARRAY, &ints), "{1,NULL,3}");

        let mut texts = Vec::new();
        for word in [1i32, 0, 25, 2, 1] {
            texts.extend_from_slice(&word.to_be_bytes());
        }
        for value in ["a b", "x"] {
            texts.extend_from_slice(&(value.len() as i32).to_be_bytes());
            texts.extend_from_slice(value.as_bytes());
        }
        assert_eq!(decode(&Type::TEXT_ARRAY, &texts), "{\"a b\",x}");
    }

    #[test]
    fn test_undecodable_value_is_named_after_its_type() {
        assert_eq!(decode(&Type::POINT, &[0xff, 0xfe]), "<point>");
        assert_eq!(decode(&Type::INT4, &[1, 2]), "<int4>");
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let driver = PostgreSqlDriver::new();
        let err = driver.connect("postgresql://localhost:notaport/db", "", "").await.err().unwrap();
        assert!(matches!(err, AppError::DriverUnavailable { .. }));
    }
}
