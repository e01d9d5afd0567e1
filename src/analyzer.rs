use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use sqlx::{MySqlPool, Row as _};

use crate::error::SyncError;
use crate::mapper::{self, ColumnType};
use crate::warehouse::{ColumnSchema, SYNC_MODE_COL, SYNC_TIMESTAMP_COL, TENANT_ID_COL};

/// Timestamp column names preferred for incremental windows, best first.
const TIMESTAMP_PRIORITY: [&str; 10] = [
    "updated_at",
    "update_time",
    "last_updated",
    "modified_at",
    "last_modified",
    "created_at",
    "create_time",
    "insert_time",
    "timestamp",
    "sync_time",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Full source type string, modifiers included (`decimal(10,2)`).
    pub source_type: String,
}

/// Per-(tenant, table) metadata, immutable once cached.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub columns: Vec<SourceColumn>,
    /// Destination schema: mapped source columns followed by the three
    /// system columns.
    pub schema: Vec<ColumnSchema>,
    pub field_types: BTreeMap<String, String>,
    pub primary_keys: Vec<String>,
    pub timestamp_field: Option<String>,
}

impl TableInfo {
    pub fn build(columns: Vec<SourceColumn>, primary_keys: Vec<String>) -> Self {
        let mut schema: Vec<ColumnSchema> = columns
            .iter()
            .map(|c| ColumnSchema::new(c.name.clone(), mapper::map_type(&c.source_type)))
            .collect();
        schema.push(ColumnSchema::new(TENANT_ID_COL, ColumnType::String));
        schema.push(ColumnSchema::new(SYNC_TIMESTAMP_COL, ColumnType::Timestamp));
        schema.push(ColumnSchema::new(SYNC_MODE_COL, ColumnType::String));

        let field_types = columns
            .iter()
            .map(|c| (c.name.clone(), c.source_type.clone()))
            .collect();

        let timestamp_field = select_timestamp_field(&columns);

        Self {
            columns,
            schema,
            field_types,
            primary_keys,
            timestamp_field,
        }
    }

    pub fn source_type_of(&self, column: &str) -> Option<&str> {
        self.field_types.get(column).map(String::as_str)
    }
}

/// Collect candidates whose name hints at a timestamp and whose type can
/// carry one, then pick by the priority list, falling back to ordinal order.
pub fn select_timestamp_field(columns: &[SourceColumn]) -> Option<String> {
    let mut candidates: Vec<&SourceColumn> = Vec::new();
    for col in columns {
        let name = col.name.to_ascii_lowercase();
        let ty = col.source_type.to_ascii_lowercase();

        let name_hints = ["time", "date", "created", "updated", "modified"]
            .iter()
            .any(|hint| name.contains(hint));
        if !name_hints {
            continue;
        }

        let datetime_typed = ty.starts_with("datetime") || ty.starts_with("timestamp");
        let integer_backed = ty.contains("int")
            && ["time", "created", "updated"].iter().any(|kw| name.contains(kw));
        if datetime_typed || integer_backed {
            candidates.push(col);
        }
    }

    for preferred in TIMESTAMP_PRIORITY {
        if let Some(col) = candidates
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(preferred))
        {
            return Some(col.name.clone());
        }
    }
    candidates.first().map(|c| c.name.clone())
}

/// Discovers source table shape once per (tenant, table) and memoizes it
/// for the rest of the run.
pub struct TableAnalyzer {
    pool: MySqlPool,
    cache: Mutex<HashMap<String, Arc<TableInfo>>>,
}

impl TableAnalyzer {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    // A poisoned cache lock only means a concurrent table task panicked;
    // the map itself is still usable.
    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TableInfo>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn table_info(&self, tenant: &str, table: &str) -> Result<Arc<TableInfo>, SyncError> {
        let key = format!("{}.{}", tenant, table);
        if let Some(info) = self.cache_lock().get(&key).cloned() {
            debug!("Using cached table info for {}", key);
            return Ok(info);
        }

        let mut conn = self.pool.acquire().await?;

        let discovery_err = |e: sqlx::Error| SyncError::SchemaDiscovery {
            tenant: tenant.to_string(),
            table: table.to_string(),
            message: e.to_string(),
        };

        let column_rows = sqlx::query(
            "SELECT COLUMN_NAME, COLUMN_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
        )
        .bind(tenant)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(discovery_err)?;

        if column_rows.is_empty() {
            return Err(SyncError::SchemaDiscovery {
                tenant: tenant.to_string(),
                table: table.to_string(),
                message: "table not found in source schema".to_string(),
            });
        }

        let mut columns = Vec::with_capacity(column_rows.len());
        for row in &column_rows {
            let name: String = row.try_get("COLUMN_NAME").map_err(discovery_err)?;
            let source_type: String = row.try_get("COLUMN_TYPE").map_err(discovery_err)?;
            columns.push(SourceColumn {
                name,
                source_type: source_type.to_ascii_lowercase(),
            });
        }

        let pk_rows = sqlx::query(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
        )
        .bind(tenant)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(discovery_err)?;

        let mut primary_keys = Vec::with_capacity(pk_rows.len());
        for row in &pk_rows {
            primary_keys.push(row.try_get::<String, _>("COLUMN_NAME").map_err(discovery_err)?);
        }
        drop(conn);

        let info = Arc::new(TableInfo::build(columns, primary_keys));
        info!(
            "Analyzed {}: {} columns, primary key {:?}, timestamp field {:?}",
            key,
            info.columns.len(),
            info.primary_keys,
            info.timestamp_field
        );

        self.cache_lock().insert(key, Arc::clone(&info));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            source_type: ty.to_string(),
        }
    }

    #[test]
    fn updated_at_beats_created_at() {
        let columns = vec![
            col("id", "int(11)"),
            col("created_at", "datetime"),
            col("updated_at", "datetime"),
        ];
        assert_eq!(select_timestamp_field(&columns).as_deref(), Some("updated_at"));
    }

    #[test]
    fn integer_backed_timestamp_qualifies() {
        let columns = vec![col("id", "bigint(20)"), col("create_time", "int(11)")];
        assert_eq!(select_timestamp_field(&columns).as_deref(), Some("create_time"));
    }

    #[test]
    fn plain_date_column_is_not_a_candidate() {
        // Name hints at a date, but the type is DATE, not datetime/timestamp.
        let columns = vec![col("id", "int(11)"), col("birth_date", "date")];
        assert_eq!(select_timestamp_field(&columns), None);
    }

    #[test]
    fn falls_back_to_first_candidate_in_ordinal_order() {
        let columns = vec![
            col("id", "int(11)"),
            col("last_seen_time", "datetime"),
            col("archived_time", "datetime"),
        ];
        assert_eq!(
            select_timestamp_field(&columns).as_deref(),
            Some("last_seen_time")
        );
    }

    #[test]
    fn no_candidates_yields_none() {
        let columns = vec![col("id", "int(11)"), col("name", "varchar(64)")];
        assert_eq!(select_timestamp_field(&columns), None);
    }

    #[test]
    fn schema_ends_with_system_columns() {
        let info = TableInfo::build(
            vec![col("id", "int(11)"), col("price", "decimal(10,2)")],
            vec!["id".to_string()],
        );
        let names: Vec<&str> = info.schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "price", "tenant_id", "sync_timestamp", "sync_mode"]
        );
        assert_eq!(info.schema[0].column_type, ColumnType::Int64);
        assert_eq!(info.schema[1].column_type, ColumnType::Numeric);
        assert_eq!(info.schema[2].column_type, ColumnType::String);
        assert_eq!(info.schema[3].column_type, ColumnType::Timestamp);
        assert_eq!(info.schema[4].column_type, ColumnType::String);
    }

    #[test]
    fn build_is_deterministic() {
        let columns = vec![
            col("id", "int(11)"),
            col("updated_at", "timestamp"),
            col("note", "text"),
        ];
        let a = TableInfo::build(columns.clone(), vec!["id".to_string()]);
        let b = TableInfo::build(columns, vec!["id".to_string()]);
        assert_eq!(a, b);
    }
}
