//! Raw data-access handle over a `sqlx` Postgres pool.

use async_trait::async_trait;
use enclave_core::sql::{
    Context, Database, ExecResult, IsolationLevel, Query, Row, SqlError, SqlValue, Transaction,
    TxOptions,
};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat};
use sqlx::types::Json;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef as _};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Raw handle: every operation runs on a pooled connection.
///
/// The handle ignores the [`Context`]; transaction propagation is the job of
/// the decorators composed around it.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Wrap a pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn execute(&self, _ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        let result = prepare(query).execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn fetch_all(&self, _ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        let rows = prepare(query).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        let statement = set_transaction_statement(options)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SqlError::Transaction(format!("failed to begin: {e}")))?;
        if let Some(statement) = statement {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    SqlError::Transaction(format!("failed to configure transaction: {e}"))
                })?;
        }
        Ok(Arc::new(PgTransaction {
            inner: Mutex::new(Some(tx)),
        }))
    }
}

/// An open Postgres transaction.
///
/// Dropping an uncompleted transaction rolls it back.
pub struct PgTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, query: &Query) -> Result<ExecResult, SqlError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(SqlError::TransactionCompleted)?;
        let result = prepare(query).execute(&mut **tx).await.map_err(map_sqlx_error)?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn fetch_all(&self, query: &Query) -> Result<Vec<Row>, SqlError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(SqlError::TransactionCompleted)?;
        let rows = prepare(query).fetch_all(&mut **tx).await.map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(&self) -> Result<(), SqlError> {
        let tx = self.inner.lock().await.take().ok_or(SqlError::TransactionCompleted)?;
        tx.commit()
            .await
            .map_err(|e| SqlError::Transaction(format!("commit failed: {e}")))
    }

    async fn rollback(&self) -> Result<(), SqlError> {
        let tx = self.inner.lock().await.take().ok_or(SqlError::TransactionCompleted)?;
        tx.rollback()
            .await
            .map_err(|e| SqlError::Transaction(format!("rollback failed: {e}")))
    }
}

/// `SET TRANSACTION` statement for `options`, if any setting differs from the default.
///
/// # Errors
///
/// Returns [`SqlError::Unsupported`] for isolation levels Postgres does not offer.
pub fn set_transaction_statement(options: &TxOptions) -> Result<Option<String>, SqlError> {
    let isolation = match options.isolation {
        IsolationLevel::Default => None,
        IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
        IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
        IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
        IsolationLevel::Serializable => Some("SERIALIZABLE"),
        level @ (IsolationLevel::WriteCommitted
        | IsolationLevel::Snapshot
        | IsolationLevel::Linearizable) => {
            return Err(SqlError::Unsupported(format!(
                "isolation level {level} is not available in Postgres"
            )));
        },
    };

    let mut modes = Vec::new();
    if let Some(isolation) = isolation {
        modes.push(format!("ISOLATION LEVEL {isolation}"));
    }
    if options.read_only {
        modes.push("READ ONLY".to_string());
    }

    if modes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("SET TRANSACTION {}", modes.join(", "))))
    }
}

/// A `NULL` parameter sent with an unspecified type, so the server infers it
/// from the statement like it does for a `NULL` literal.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn prepare(query: &Query) -> sqlx::query::Query<'_, Postgres, PgArguments> {
    let prepared = query
        .params()
        .iter()
        .fold(sqlx::query(query.sql()), |prepared, param| match param {
            SqlValue::Null => prepared.bind(UntypedNull),
            SqlValue::Bool(v) => prepared.bind(*v),
            SqlValue::Int(v) => prepared.bind(*v),
            SqlValue::Float(v) => prepared.bind(*v),
            SqlValue::Text(v) => prepared.bind(v.as_str()),
            SqlValue::Bytes(v) => prepared.bind(v.as_slice()),
            SqlValue::Json(v) => prepared.bind(Json(v)),
        });
    // Inferred parameter types must not be cached against the statement text.
    if query.params().iter().any(SqlValue::is_null) {
        prepared.persistent(false)
    } else {
        prepared
    }
}

fn map_sqlx_error(error: sqlx::Error) -> SqlError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => SqlError::Connection(error.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            SqlError::Decode(error.to_string())
        },
        other => SqlError::Query(other.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, SqlError> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let value = decode_column(row, index, column.type_info())
            .map_err(|e| SqlError::Decode(format!("column {}: {e}", column.name())))?;
        decoded.push(column.name(), value);
    }
    Ok(decoded)
}

fn decode_column(
    row: &PgRow,
    index: usize,
    type_info: &PgTypeInfo,
) -> Result<SqlValue, sqlx::Error> {
    let value = match type_info.name() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.into(),
        "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(index)?.into(),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(index)?
            .map(|uuid| uuid.to_string())
            .into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|ts| ts.to_rfc3339())
            .into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|ts| ts.to_string())
            .into(),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|date| date.to_string())
            .into(),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|time| time.to_string())
            .into(),
        "INTERVAL" => row
            .try_get::<Option<PgInterval>, _>(index)?
            .map(|interval| interval_text(&interval))
            .into(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => {
            row.try_get::<Option<String>, _>(index)?.into()
        },
        "BOOL[]" => decode_array::<bool>(row, index)?,
        "INT2[]" => decode_array::<i16>(row, index)?,
        "INT4[]" => decode_array::<i32>(row, index)?,
        "INT8[]" => decode_array::<i64>(row, index)?,
        "FLOAT8[]" => decode_array::<f64>(row, index)?,
        "TEXT[]" | "VARCHAR[]" => decode_array::<String>(row, index)?,
        "VOID" => SqlValue::Null,
        _ => decode_raw(row, index, type_info)?,
    };
    Ok(value)
}

/// One-dimensional arrays become JSON arrays; `NULL` elements stay `null`.
fn decode_array<T>(row: &PgRow, index: usize) -> Result<SqlValue, sqlx::Error>
where
    Option<Vec<Option<T>>>: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    T: Into<serde_json::Value>,
{
    Ok(row
        .try_get::<Option<Vec<Option<T>>>, _>(index)?
        .map(serde_json::Value::from)
        .into())
}

/// Types without a dedicated mapping.
///
/// Enum labels and text-format values become text, `NUMERIC` and network
/// addresses are rendered in their Postgres text form, anything else is
/// returned as the raw wire bytes.
fn decode_raw(row: &PgRow, index: usize, type_info: &PgTypeInfo) -> Result<SqlValue, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let textual = matches!(raw.format(), PgValueFormat::Text)
        || matches!(type_info.kind(), PgTypeKind::Enum(_));
    if textual {
        return Ok(SqlValue::Text(raw.as_str().map_err(sqlx::Error::Decode)?.to_string()));
    }

    let bytes = raw.as_bytes().map_err(sqlx::Error::Decode)?;
    let text = match type_info.name() {
        "NUMERIC" => numeric_text(bytes),
        "INET" | "CIDR" => inet_text(bytes),
        _ => return Ok(SqlValue::Bytes(bytes.to_vec())),
    };
    text.map(SqlValue::Text)
        .ok_or_else(|| sqlx::Error::Decode(format!("malformed {} value", type_info.name()).into()))
}

/// ISO 8601 duration, e.g. `P1M2DT3600S`.
fn interval_text(interval: &PgInterval) -> String {
    let sign = if interval.microseconds < 0 { "-" } else { "" };
    let micros = interval.microseconds.unsigned_abs();
    let (seconds, fraction) = (micros / 1_000_000, micros % 1_000_000);
    if fraction == 0 {
        format!("P{}M{}DT{sign}{seconds}S", interval.months, interval.days)
    } else {
        format!("P{}M{}DT{sign}{seconds}.{fraction:06}S", interval.months, interval.days)
    }
}

/// Binary `NUMERIC`: a header of digit count, weight, sign and display scale,
/// then base-10000 digits starting at the weight position.
fn numeric_text(bytes: &[u8]) -> Option<String> {
    let (header, body) = bytes.split_first_chunk::<8>()?;
    let ndigits = usize::from(u16::from_be_bytes([header[0], header[1]]));
    let weight = i32::from(i16::from_be_bytes([header[2], header[3]]));
    let sign = u16::from_be_bytes([header[4], header[5]]);
    let scale = usize::from(u16::from_be_bytes([header[6], header[7]]));
    let digits: Vec<u16> = body
        .get(..ndigits * 2)?
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let mut text = match sign {
        0x0000 => String::new(),
        0x4000 => String::from("-"),
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    };
    let digit = |position: i32| {
        usize::try_from(position)
            .ok()
            .and_then(|position| digits.get(position))
            .copied()
            .unwrap_or(0)
    };

    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for position in 1..=weight {
            text.push_str(&format!("{:04}", digit(position)));
        }
    }

    if scale > 0 {
        let mut fraction = String::with_capacity(scale + 3);
        for position in (weight + 1..).take(scale.div_ceil(4)) {
            fraction.push_str(&format!("{:04}", digit(position)));
        }
        fraction.truncate(scale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}

/// Binary `INET`/`CIDR`: family, prefix bits, cidr flag, address length,
/// address bytes.
fn inet_text(bytes: &[u8]) -> Option<String> {
    let (&[family, bits, is_cidr, _], address) = bytes.split_first_chunk::<4>()?;
    let (address, max_bits) = match family {
        2 => (IpAddr::from(<[u8; 4]>::try_from(address).ok()?), 32),
        3 => (IpAddr::from(<[u8; 16]>::try_from(address).ok()?), 128),
        _ => return None,
    };
    if is_cidr == 1 || bits != max_bits {
        Some(format!("{address}/{bits}"))
    } else {
        Some(address.to_string())
    }
}
