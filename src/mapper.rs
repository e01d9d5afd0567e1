use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use log::warn;
use serde_json::Value;

/// Destination column types understood by the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Numeric,
    Float64,
    String,
    Date,
    Timestamp,
    Bytes,
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int64 => "INT64",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::String => "STRING",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Bytes => "BYTES",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

/// Characters before any parenthesised modifier, case-folded.
/// `decimal(10,2)` -> `decimal`, `INT(11)` -> `int`.
pub fn base_type(source_type: &str) -> String {
    source_type
        .split('(')
        .next()
        .unwrap_or(source_type)
        .trim()
        .to_ascii_lowercase()
}

/// Fixed projection from MySQL type families to warehouse types. Unknown
/// base types fall through to STRING.
pub fn map_type(source_type: &str) -> ColumnType {
    match base_type(source_type).as_str() {
        "int" | "bigint" | "tinyint" | "smallint" | "mediumint" => ColumnType::Int64,
        "decimal" | "numeric" => ColumnType::Numeric,
        "float" | "double" => ColumnType::Float64,
        "varchar" | "char" | "text" | "mediumtext" | "longtext" | "json" | "time" | "enum"
        | "set" => ColumnType::String,
        "date" => ColumnType::Date,
        "datetime" | "timestamp" => ColumnType::Timestamp,
        "blob" | "binary" | "varbinary" => ColumnType::Bytes,
        _ => ColumnType::String,
    }
}

pub fn iso_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Coerce one value to its destination type. Conversion failures fall back
/// to the string rendering of the literal, with a warning; they never fail
/// the row.
pub fn coerce_value(value: Value, dest: ColumnType, source_type: &str) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match dest {
        ColumnType::String => stringify(value),
        ColumnType::Int64 => coerce_int(value),
        ColumnType::Float64 | ColumnType::Numeric => coerce_float(value, dest),
        ColumnType::Boolean => coerce_bool(value),
        ColumnType::Timestamp => coerce_timestamp(value, source_type),
        ColumnType::Date => coerce_date(value),
        // Binary values arrive base64-encoded from extraction.
        ColumnType::Bytes => stringify(value),
    }
}

fn stringify(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => Value::String(other.to_string()),
    }
}

fn string_fallback(value: Value, dest: ColumnType) -> Value {
    warn!(
        "type coercion failed: {} -> {}, keeping string literal",
        value,
        dest.as_str()
    );
    stringify(value)
}

fn coerce_int(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Value::Number(n)
            } else if let Some(f) = n.as_f64() {
                Value::Number(serde_json::Number::from(f.trunc() as i64))
            } else {
                string_fallback(Value::Number(n), ColumnType::Int64)
            }
        }
        Value::Bool(b) => Value::Number(serde_json::Number::from(b as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Null;
            }
            match trimmed.parse::<i64>() {
                Ok(n) => Value::Number(serde_json::Number::from(n)),
                Err(_) => string_fallback(Value::String(s), ColumnType::Int64),
            }
        }
        other => string_fallback(other, ColumnType::Int64),
    }
}

fn coerce_float(value: Value, dest: ColumnType) -> Value {
    match value {
        Value::Number(n) => match n.as_f64().and_then(serde_json::Number::from_f64) {
            Some(f) => Value::Number(f),
            None => string_fallback(Value::Number(n), dest),
        },
        Value::Bool(b) => Value::Number(serde_json::Number::from(b as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Null;
            }
            match trimmed.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(f) => Value::Number(f),
                None => string_fallback(Value::String(s), dest),
            }
        }
        other => string_fallback(other, dest),
    }
}

fn coerce_bool(value: Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(b),
        Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => {
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                Value::Bool(s.parse::<i128>().map(|n| n != 0).unwrap_or(true))
            } else {
                Value::Bool(!s.is_empty())
            }
        }
        Value::Array(a) => Value::Bool(!a.is_empty()),
        Value::Object(o) => Value::Bool(!o.is_empty()),
        Value::Null => Value::Null,
    }
}

fn coerce_timestamp(value: Value, source_type: &str) -> Value {
    match value {
        Value::String(s) => match parse_datetime(&s) {
            Some(dt) => Value::String(iso_datetime(&dt)),
            None => Value::String(s),
        },
        Value::Number(n) => {
            // Integer-backed timestamps are Unix seconds when the source
            // type string carries `time` (e.g. an `int` create_time column).
            if let Some(secs) = n.as_i64() {
                if source_type.to_ascii_lowercase().contains("time") {
                    if let Some(dt) = Local.timestamp_opt(secs, 0).single() {
                        return Value::String(iso_datetime(&dt.naive_local()));
                    }
                }
            }
            Value::String(n.to_string())
        }
        other => stringify(other),
    }
}

fn coerce_date(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if NaiveDate::parse_from_str(&s, "%Y-%m-%d").is_ok() {
                Value::String(s)
            } else if let Some(dt) = parse_datetime(&s) {
                Value::String(dt.date().format("%Y-%m-%d").to_string())
            } else {
                Value::String(s)
            }
        }
        other => stringify(other),
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    s.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
}
