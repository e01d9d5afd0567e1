use base64::Engine as _;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use log::{debug, info};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row as _};

use crate::analyzer::TableInfo;
use crate::error::SyncError;
use crate::mapper::{self, iso_datetime};
use crate::sync::SyncMode;
use crate::warehouse::{Row, SYNC_MODE_COL, SYNC_TIMESTAMP_COL, TENANT_ID_COL};

/// Pulls one batch of rows from a tenant schema and annotates it with the
/// system fields. The source connection is released before any warehouse
/// I/O happens.
pub struct Extractor {
    pool: MySqlPool,
    lookback_minutes: i64,
}

impl Extractor {
    pub fn new(pool: MySqlPool, lookback_minutes: i64) -> Self {
        Self {
            pool,
            lookback_minutes,
        }
    }

    /// Callers downgrade to FULL when there is no prior checkpoint or no
    /// timestamp field; INCREMENTAL here requires both.
    pub async fn fetch(
        &self,
        tenant: &str,
        table: &str,
        info: &TableInfo,
        mode: SyncMode,
        last_sync: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<Vec<Row>, SyncError> {
        let mut conn = self.pool.acquire().await?;

        let raw_rows: Vec<MySqlRow> = match mode {
            SyncMode::Full => {
                debug!("Full extraction from `{}`.`{}`", tenant, table);
                sqlx::query(&full_query(tenant, table))
                    .fetch_all(&mut *conn)
                    .await?
            }
            SyncMode::Incremental => {
                let ts_field = info.timestamp_field.as_deref().ok_or_else(|| {
                    SyncError::Config(format!(
                        "incremental extraction of {}.{} without a timestamp field",
                        tenant, table
                    ))
                })?;
                let last = last_sync.ok_or_else(|| {
                    SyncError::Config(format!(
                        "incremental extraction of {}.{} without a prior sync time",
                        tenant, table
                    ))
                })?;

                let safe_start = window_start(last, self.lookback_minutes);
                let query = incremental_query(tenant, table, ts_field);
                let integer_backed = info
                    .source_type_of(ts_field)
                    .map(|ty| ty.contains("int"))
                    .unwrap_or(false);

                if integer_backed {
                    let (lo, hi) = (unix_seconds(&safe_start), unix_seconds(&now));
                    debug!(
                        "Incremental extraction from `{}`.`{}`: {} in ({}, {}]",
                        tenant, table, ts_field, lo, hi
                    );
                    sqlx::query(&query)
                        .bind(lo)
                        .bind(hi)
                        .fetch_all(&mut *conn)
                        .await?
                } else {
                    debug!(
                        "Incremental extraction from `{}`.`{}`: {} in ({}, {}]",
                        tenant, table, ts_field, safe_start, now
                    );
                    sqlx::query(&query)
                        .bind(safe_start)
                        .bind(now)
                        .fetch_all(&mut *conn)
                        .await?
                }
            }
        };
        drop(conn);

        if raw_rows.is_empty() {
            return Ok(Vec::new());
        }
        info!("Fetched {} rows from `{}`.`{}`", raw_rows.len(), tenant, table);

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in &raw_rows {
            let mut record = Row::new();
            for (idx, col) in info.columns.iter().enumerate() {
                record.insert(col.name.clone(), decode_value(raw, idx, &col.source_type));
            }
            annotate(&mut record, tenant, &now, mode);
            rows.push(record);
        }
        Ok(rows)
    }
}

pub fn full_query(tenant: &str, table: &str) -> String {
    format!("SELECT * FROM `{}`.`{}`", tenant, table)
}

pub fn incremental_query(tenant: &str, table: &str, ts_field: &str) -> String {
    format!(
        "SELECT * FROM `{tenant}`.`{table}` WHERE `{ts}` > ? AND `{ts}` <= ? ORDER BY `{ts}` ASC",
        tenant = tenant,
        table = table,
        ts = ts_field
    )
}

/// Windows overlap by the lookback to absorb clock skew and late commits;
/// MERGE collapses the duplicates.
pub fn window_start(last_sync: NaiveDateTime, lookback_minutes: i64) -> NaiveDateTime {
    last_sync - Duration::minutes(lookback_minutes)
}

fn unix_seconds(dt: &NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(dt)
        .earliest()
        .map(|t| t.timestamp())
        .unwrap_or_else(|| dt.and_utc().timestamp())
}

pub fn annotate(record: &mut Row, tenant: &str, now: &NaiveDateTime, mode: SyncMode) {
    record.insert(TENANT_ID_COL.to_string(), Value::String(tenant.to_string()));
    record.insert(
        SYNC_TIMESTAMP_COL.to_string(),
        Value::String(iso_datetime(now)),
    );
    record.insert(
        SYNC_MODE_COL.to_string(),
        Value::String(mode.as_str().to_string()),
    );
}

/// Table-directed decode: the source type string from the analyzer picks the
/// Rust type to read, with progressively looser fallbacks. Datetimes come
/// out as ISO-8601 strings and fixed decimals as their floating
/// approximation, so downstream stages only ever see JSON values.
fn decode_value(row: &MySqlRow, idx: usize, source_type: &str) -> Value {
    match mapper::base_type(source_type).as_str() {
        "int" | "bigint" | "tinyint" | "smallint" | "mediumint" | "year" => {
            decode_integer(row, idx)
        }
        "decimal" | "numeric" => decode_decimal(row, idx),
        "float" | "double" => decode_float(row, idx),
        "date" => decode_date(row, idx),
        "datetime" | "timestamp" => decode_datetime(row, idx),
        "time" => decode_time(row, idx),
        "json" => decode_json(row, idx),
        "blob" | "binary" | "varbinary" => decode_bytes(row, idx),
        _ => decode_text(row, idx),
    }
}

fn decode_integer(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(|b| Value::from(b as i64)).unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_decimal(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return match v {
            Some(d) => d
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(d.to_string())),
            None => Value::Null,
        };
    }
    decode_float(row, idx)
}

fn decode_float(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v
            .and_then(|f| serde_json::Number::from_f64(f as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_date(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_datetime(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::String(iso_datetime(&dt)))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<Utc>>, _>(idx) {
        return v
            .map(|dt| Value::String(iso_datetime(&dt.with_timezone(&Local).naive_local())))
            .unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_time(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_json(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_bytes(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b)))
            .unwrap_or(Value::Null);
    }
    decode_text(row, idx)
}

fn decode_text(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b)))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn full_query_shape() {
        assert_eq!(full_query("shop_a", "orders"), "SELECT * FROM `shop_a`.`orders`");
    }

    #[test]
    fn incremental_query_shape() {
        assert_eq!(
            incremental_query("shop_a", "orders", "updated_at"),
            "SELECT * FROM `shop_a`.`orders` WHERE `updated_at` > ? AND `updated_at` <= ? \
             ORDER BY `updated_at` ASC"
        );
    }

    #[test]
    fn window_subtracts_lookback() {
        assert_eq!(window_start(at(10, 30), 10), at(10, 20));
        assert_eq!(window_start(at(0, 5), 10), at(23, 55) - Duration::days(1));
    }

    #[test]
    fn unix_window_preserves_width() {
        let last = at(10, 30);
        let start = window_start(last, 10);
        assert_eq!(unix_seconds(&last) - unix_seconds(&start), 600);
    }

    #[test]
    fn annotation_sets_system_fields() {
        let mut record = Row::new();
        record.insert("id".to_string(), json!(1));
        annotate(&mut record, "shop_a", &at(10, 0), SyncMode::Incremental);
        assert_eq!(record["tenant_id"], json!("shop_a"));
        assert_eq!(record["sync_timestamp"], json!("2024-01-15T10:00:00"));
        assert_eq!(record["sync_mode"], json!("INCREMENTAL"));
    }
}
