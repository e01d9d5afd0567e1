use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde_json::Value;

use crate::error::SyncError;
use crate::sync::SyncMode;
use crate::warehouse::{
    ColumnSchema, Row, TableOptions, Warehouse, SYNC_TIMESTAMP_COL, TENANT_ID_COL,
};

/// Applies extracted batches to the destination: table creation, tenant
/// scoped full reloads, and MERGE-via-staging for keyed incremental syncs.
pub struct Applier {
    warehouse: Arc<dyn Warehouse>,
    project: String,
    dataset: String,
}

impl Applier {
    pub fn new(warehouse: Arc<dyn Warehouse>, project: &str, dataset: &str) -> Self {
        Self {
            warehouse,
            project: project.to_string(),
            dataset: dataset.to_string(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, table)
    }

    pub async fn ensure_dataset(&self) -> Result<(), SyncError> {
        self.warehouse.ensure_dataset(&self.dataset).await
    }

    /// Create the shared multi-tenant table if absent: day-partitioned on
    /// `sync_timestamp`, clustered on `tenant_id`. Existing tables are
    /// trusted as-is; destination schema evolution is out of scope.
    pub async fn ensure_table(
        &self,
        table: &str,
        schema: &[ColumnSchema],
    ) -> Result<(), SyncError> {
        if self.warehouse.table_exists(&self.dataset, table).await? {
            return Ok(());
        }
        info!("Creating destination table {}", self.qualified(table));
        let options = TableOptions {
            partition_day_field: Some(SYNC_TIMESTAMP_COL.to_string()),
            clustering: vec![TENANT_ID_COL.to_string()],
        };
        self.warehouse
            .create_table(&self.dataset, table, schema, &options)
            .await
    }

    pub async fn write(
        &self,
        table: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
        primary_keys: &[String],
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        if rows.is_empty() {
            return Ok(());
        }
        match mode {
            SyncMode::Full => self.full_reload(table, rows, schema).await,
            SyncMode::Incremental if !primary_keys.is_empty() => {
                self.merge_via_staging(table, rows, schema, primary_keys).await
            }
            SyncMode::Incremental => {
                // Without a primary key there is nothing to match on;
                // updates will surface as additional rows.
                warn!(
                    "No primary key on {}: appending {} rows without dedup",
                    table,
                    rows.len()
                );
                self.warehouse
                    .load_rows(&self.dataset, table, rows, schema)
                    .await
            }
        }
    }

    /// Tenant-scoped full reload: DELETE this tenant's rows, then append the
    /// fresh batch. Other tenants' rows are untouched.
    async fn full_reload(
        &self,
        table: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
    ) -> Result<(), SyncError> {
        let tenant = rows[0]
            .get(TENANT_ID_COL)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SyncError::Config(format!("rows for {} are missing tenant_id", table))
            })?;

        let delete_sql = format!(
            "DELETE FROM {} WHERE tenant_id = '{}'",
            self.qualified(table),
            tenant.replace('\'', "''")
        );
        self.warehouse.run_query(&delete_sql).await?;
        info!("Removed existing rows of tenant {} from {}", tenant, table);

        self.warehouse
            .load_rows(&self.dataset, table, rows, schema)
            .await?;
        info!("Full reload of {} complete: {} rows (tenant {})", table, rows.len(), tenant);
        Ok(())
    }

    async fn merge_via_staging(
        &self,
        table: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
        primary_keys: &[String],
    ) -> Result<(), SyncError> {
        let staging = self.create_staging_table(table, schema).await?;

        let result = self
            .load_and_merge(table, &staging, rows, schema, primary_keys)
            .await;

        // The staging table is dropped whether or not the MERGE succeeded.
        if let Err(e) = self.warehouse.delete_table(&self.dataset, &staging).await {
            warn!("Cannot drop staging table {}: {}", staging, e);
        }
        result
    }

    async fn create_staging_table(
        &self,
        table: &str,
        schema: &[ColumnSchema],
    ) -> Result<String, SyncError> {
        let mut suffix = epoch_millis();
        let mut retried = false;
        loop {
            let staging = staging_table_name(table, suffix);
            match self
                .warehouse
                .create_table(&self.dataset, &staging, schema, &TableOptions::default())
                .await
            {
                Ok(()) => return Ok(staging),
                Err(e) if !retried && is_name_collision(&e) => {
                    warn!("Staging table {} already exists, retrying with a fresh suffix", staging);
                    suffix += 1;
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_and_merge(
        &self,
        table: &str,
        staging: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
        primary_keys: &[String],
    ) -> Result<(), SyncError> {
        self.warehouse
            .load_rows(&self.dataset, staging, rows, schema)
            .await?;

        let merge_sql = merge_statement(
            &self.qualified(table),
            &self.qualified(staging),
            schema,
            primary_keys,
        );
        self.warehouse.run_query(&merge_sql).await?;
        info!("Merged {} rows into {}", rows.len(), table);
        Ok(())
    }
}

pub fn staging_table_name(table: &str, epoch_millis: u128) -> String {
    format!("{}_temp_{}", table, epoch_millis)
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis()
}

fn is_name_collision(e: &SyncError) -> bool {
    match e {
        SyncError::Warehouse { message, .. } => {
            let message = message.to_ascii_lowercase();
            message.contains("already exists") || message.contains("duplicate")
        }
        _ => false,
    }
}

/// Upsert by primary key + tenant_id: matched rows take every non-key column
/// from the staging side, unmatched rows are inserted whole.
pub fn merge_statement(
    target: &str,
    staging: &str,
    schema: &[ColumnSchema],
    primary_keys: &[String],
) -> String {
    let mut on: Vec<String> = primary_keys
        .iter()
        .map(|pk| format!("T.`{pk}` = S.`{pk}`", pk = pk))
        .collect();
    on.push(format!("T.`{0}` = S.`{0}`", TENANT_ID_COL));

    let updates: Vec<String> = schema
        .iter()
        .filter(|c| !primary_keys.contains(&c.name))
        .map(|c| format!("`{0}` = S.`{0}`", c.name))
        .collect();
    let insert_cols: Vec<String> = schema.iter().map(|c| format!("`{}`", c.name)).collect();
    let insert_vals: Vec<String> = schema.iter().map(|c| format!("S.`{}`", c.name)).collect();

    format!(
        "MERGE {target} T USING {staging} S ON {on} \
         WHEN MATCHED THEN UPDATE SET {updates} \
         WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({vals})",
        target = target,
        staging = staging,
        on = on.join(" AND "),
        updates = updates.join(", "),
        cols = insert_cols.join(", "),
        vals = insert_vals.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ColumnType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        EnsureDataset(String),
        CreateTable {
            table: String,
            partitioned: bool,
            clustered: bool,
        },
        LoadRows {
            table: String,
            count: usize,
        },
        Query(String),
        DeleteTable(String),
    }

    #[derive(Default)]
    struct RecordingWarehouse {
        ops: Mutex<Vec<Op>>,
        existing_tables: Vec<String>,
        fail_merge: bool,
        collide_once: bool,
    }

    impl RecordingWarehouse {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: Op) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn ensure_dataset(&self, dataset: &str) -> Result<(), SyncError> {
            self.record(Op::EnsureDataset(dataset.to_string()));
            Ok(())
        }

        async fn table_exists(&self, _dataset: &str, table: &str) -> Result<bool, SyncError> {
            Ok(self.existing_tables.iter().any(|t| t == table))
        }

        async fn create_table(
            &self,
            _dataset: &str,
            table: &str,
            _schema: &[ColumnSchema],
            options: &TableOptions,
        ) -> Result<(), SyncError> {
            let seen_before = self
                .ops()
                .iter()
                .any(|op| matches!(op, Op::CreateTable { .. }));
            self.record(Op::CreateTable {
                table: table.to_string(),
                partitioned: options.partition_day_field.is_some(),
                clustered: !options.clustering.is_empty(),
            });
            if self.collide_once && !seen_before {
                return Err(SyncError::Warehouse {
                    message: format!("Already Exists: Table {}", table),
                    transient: false,
                });
            }
            Ok(())
        }

        async fn load_rows(
            &self,
            _dataset: &str,
            table: &str,
            rows: &[Row],
            _schema: &[ColumnSchema],
        ) -> Result<(), SyncError> {
            self.record(Op::LoadRows {
                table: table.to_string(),
                count: rows.len(),
            });
            Ok(())
        }

        async fn run_query(&self, sql: &str) -> Result<(), SyncError> {
            self.record(Op::Query(sql.to_string()));
            if self.fail_merge && sql.starts_with("MERGE") {
                return Err(SyncError::Warehouse {
                    message: "invalidQuery".to_string(),
                    transient: false,
                });
            }
            Ok(())
        }

        async fn delete_table(&self, _dataset: &str, table: &str) -> Result<(), SyncError> {
            self.record(Op::DeleteTable(table.to_string()));
            Ok(())
        }
    }

    fn schema() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("id", ColumnType::Int64),
            ColumnSchema::new("amount", ColumnType::Numeric),
            ColumnSchema::new("tenant_id", ColumnType::String),
            ColumnSchema::new("sync_timestamp", ColumnType::Timestamp),
            ColumnSchema::new("sync_mode", ColumnType::String),
        ]
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), json!(i));
                row.insert("amount".to_string(), json!(10.5));
                row.insert("tenant_id".to_string(), json!("shop_a"));
                row.insert("sync_timestamp".to_string(), json!("2024-01-15T10:00:00"));
                row.insert("sync_mode".to_string(), json!("FULL"));
                row
            })
            .collect()
    }

    fn applier(warehouse: Arc<RecordingWarehouse>) -> Applier {
        Applier::new(warehouse, "acme-analytics", "replicated")
    }

    #[tokio::test]
    async fn full_write_deletes_tenant_then_appends() {
        let warehouse = Arc::new(RecordingWarehouse::default());
        let applier = applier(Arc::clone(&warehouse));

        applier
            .write("orders", &rows(3), &schema(), &["id".to_string()], SyncMode::Full)
            .await
            .unwrap();

        let ops = warehouse.ops();
        assert_eq!(
            ops[0],
            Op::Query(
                "DELETE FROM `acme-analytics.replicated.orders` WHERE tenant_id = 'shop_a'"
                    .to_string()
            )
        );
        assert_eq!(
            ops[1],
            Op::LoadRows {
                table: "orders".to_string(),
                count: 3
            }
        );
        assert_eq!(ops.len(), 2);
    }

    #[tokio::test]
    async fn keyed_incremental_merges_via_staging() {
        let warehouse = Arc::new(RecordingWarehouse::default());
        let applier = applier(Arc::clone(&warehouse));

        applier
            .write(
                "orders",
                &rows(2),
                &schema(),
                &["id".to_string()],
                SyncMode::Incremental,
            )
            .await
            .unwrap();

        let ops = warehouse.ops();
        assert_eq!(ops.len(), 4);
        let staging = match &ops[0] {
            Op::CreateTable {
                table,
                partitioned,
                clustered,
            } => {
                assert!(table.starts_with("orders_temp_"));
                assert!(!partitioned);
                assert!(!clustered);
                table.clone()
            }
            other => panic!("expected staging create, got {:?}", other),
        };
        assert_eq!(
            ops[1],
            Op::LoadRows {
                table: staging.clone(),
                count: 2
            }
        );
        match &ops[2] {
            Op::Query(sql) => {
                assert!(sql.starts_with("MERGE `acme-analytics.replicated.orders` T USING"));
                assert!(sql.contains(&staging));
            }
            other => panic!("expected MERGE, got {:?}", other),
        }
        assert_eq!(ops[3], Op::DeleteTable(staging));
    }

    #[tokio::test]
    async fn staging_is_dropped_even_when_merge_fails() {
        let warehouse = Arc::new(RecordingWarehouse {
            fail_merge: true,
            ..Default::default()
        });
        let applier = applier(Arc::clone(&warehouse));

        let err = applier
            .write(
                "orders",
                &rows(1),
                &schema(),
                &["id".to_string()],
                SyncMode::Incremental,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Warehouse { .. }));

        let ops = warehouse.ops();
        assert!(matches!(ops.last(), Some(Op::DeleteTable(_))));
    }

    #[tokio::test]
    async fn keyless_incremental_appends_directly() {
        let warehouse = Arc::new(RecordingWarehouse::default());
        let applier = applier(Arc::clone(&warehouse));

        applier
            .write("events", &rows(4), &schema(), &[], SyncMode::Incremental)
            .await
            .unwrap();

        assert_eq!(
            warehouse.ops(),
            vec![Op::LoadRows {
                table: "events".to_string(),
                count: 4
            }]
        );
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let warehouse = Arc::new(RecordingWarehouse::default());
        let applier = applier(Arc::clone(&warehouse));

        applier
            .write("orders", &[], &schema(), &["id".to_string()], SyncMode::Full)
            .await
            .unwrap();
        assert!(warehouse.ops().is_empty());
    }

    #[tokio::test]
    async fn ensure_table_creates_partitioned_clustered_table_once() {
        let warehouse = Arc::new(RecordingWarehouse::default());
        let applier1 = applier(Arc::clone(&warehouse));
        applier1.ensure_table("orders", &schema()).await.unwrap();
        assert_eq!(
            warehouse.ops(),
            vec![Op::CreateTable {
                table: "orders".to_string(),
                partitioned: true,
                clustered: true
            }]
        );

        let warehouse = Arc::new(RecordingWarehouse {
            existing_tables: vec!["orders".to_string()],
            ..Default::default()
        });
        let applier2 = applier(Arc::clone(&warehouse));
        applier2.ensure_table("orders", &schema()).await.unwrap();
        assert!(warehouse.ops().is_empty());
    }

    #[tokio::test]
    async fn staging_name_collision_retries_with_fresh_suffix() {
        let warehouse = Arc::new(RecordingWarehouse {
            collide_once: true,
            ..Default::default()
        });
        let applier = applier(Arc::clone(&warehouse));

        applier
            .write(
                "orders",
                &rows(1),
                &schema(),
                &["id".to_string()],
                SyncMode::Incremental,
            )
            .await
            .unwrap();

        let creates: Vec<String> = warehouse
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::CreateTable { table, .. } => Some(table.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(creates.len(), 2);
        assert_ne!(creates[0], creates[1]);
    }

    #[test]
    fn merge_statement_shape() {
        let sql = merge_statement("`p.d.orders`", "`p.d.orders_temp_1`", &schema(), &["id".to_string()]);
        assert_eq!(
            sql,
            "MERGE `p.d.orders` T USING `p.d.orders_temp_1` S \
             ON T.`id` = S.`id` AND T.`tenant_id` = S.`tenant_id` \
             WHEN MATCHED THEN UPDATE SET `amount` = S.`amount`, `tenant_id` = S.`tenant_id`, \
             `sync_timestamp` = S.`sync_timestamp`, `sync_mode` = S.`sync_mode` \
             WHEN NOT MATCHED THEN INSERT (`id`, `amount`, `tenant_id`, `sync_timestamp`, `sync_mode`) \
             VALUES (S.`id`, S.`amount`, S.`tenant_id`, S.`sync_timestamp`, S.`sync_mode`)",
        );
    }
}
