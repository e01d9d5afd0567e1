use std::collections::BTreeMap;

use log::debug;
use serde_json::Value;

use crate::mapper::{self, ColumnType};
use crate::warehouse::{Row, SYNC_MODE_COL, SYNC_TIMESTAMP_COL, TENANT_ID_COL};

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<Row>,
    /// Per-column count of values the coercion actually changed.
    pub changed: BTreeMap<String, usize>,
}

fn is_system_column(name: &str) -> bool {
    name == TENANT_ID_COL || name == SYNC_TIMESTAMP_COL || name == SYNC_MODE_COL
}

/// Batch-coerce every value to its destination type. Pure over its inputs:
/// system columns and nulls pass through, unknown columns stringify, and the
/// per-column change counts are returned for reporting.
pub fn normalize_batch(rows: Vec<Row>, field_types: &BTreeMap<String, String>) -> NormalizedBatch {
    if rows.is_empty() {
        return NormalizedBatch::default();
    }

    let converters: BTreeMap<&str, (ColumnType, &str)> = field_types
        .iter()
        .map(|(name, source_type)| {
            (
                name.as_str(),
                (mapper::map_type(source_type), source_type.as_str()),
            )
        })
        .collect();

    let mut changed: BTreeMap<String, usize> = BTreeMap::new();
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let mut normalized = Row::new();
        for (name, value) in row {
            if is_system_column(&name) || value.is_null() {
                normalized.insert(name, value);
                continue;
            }
            let coerced = match converters.get(name.as_str()) {
                Some((dest, source_type)) => {
                    let before = value.clone();
                    let after = mapper::coerce_value(value, *dest, source_type);
                    if after != before {
                        *changed.entry(name.clone()).or_insert(0) += 1;
                    }
                    after
                }
                // Columns the analyzer has never seen become strings.
                None => mapper::coerce_value(value, ColumnType::String, ""),
            };
            normalized.insert(name, coerced);
        }
        out.push(normalized);
    }

    for (column, count) in &changed {
        debug!("Normalized {} values in column {}", count, column);
    }

    NormalizedBatch { rows: out, changed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn types(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn empty_batch_is_empty() {
        let batch = normalize_batch(Vec::new(), &types(&[("id", "int(11)")]));
        assert!(batch.rows.is_empty());
        assert!(batch.changed.is_empty());
    }

    #[test]
    fn values_match_destination_types() {
        let field_types = types(&[("id", "int(11)"), ("price", "decimal(10,2)")]);
        let batch = normalize_batch(
            vec![row(&[("id", json!("7")), ("price", json!("12.50"))])],
            &field_types,
        );
        assert_eq!(batch.rows[0]["id"], json!(7));
        assert_eq!(batch.rows[0]["price"], json!(12.5));
        assert_eq!(batch.changed.get("id"), Some(&1));
        assert_eq!(batch.changed.get("price"), Some(&1));
    }

    #[test]
    fn unchanged_values_are_not_counted() {
        let field_types = types(&[("id", "int(11)")]);
        let batch = normalize_batch(vec![row(&[("id", json!(7))])], &field_types);
        assert_eq!(batch.rows[0]["id"], json!(7));
        assert!(batch.changed.is_empty());
    }

    #[test]
    fn system_columns_pass_through() {
        let field_types = types(&[("id", "int(11)")]);
        let batch = normalize_batch(
            vec![row(&[
                ("id", json!(1)),
                ("tenant_id", json!("shop_a")),
                ("sync_timestamp", json!("2024-01-15T10:00:00")),
                ("sync_mode", json!("FULL")),
            ])],
            &field_types,
        );
        assert_eq!(batch.rows[0]["tenant_id"], json!("shop_a"));
        assert_eq!(batch.rows[0]["sync_timestamp"], json!("2024-01-15T10:00:00"));
        assert_eq!(batch.rows[0]["sync_mode"], json!("FULL"));
    }

    #[test]
    fn nulls_pass_through() {
        let field_types = types(&[("id", "int(11)")]);
        let batch = normalize_batch(vec![row(&[("id", Value::Null)])], &field_types);
        assert_eq!(batch.rows[0]["id"], Value::Null);
        assert!(batch.changed.is_empty());
    }

    #[test]
    fn unknown_columns_stringify() {
        let field_types = types(&[("id", "int(11)")]);
        let batch = normalize_batch(
            vec![row(&[("id", json!(1)), ("mystery", json!(9))])],
            &field_types,
        );
        assert_eq!(batch.rows[0]["mystery"], json!("9"));
    }
}
