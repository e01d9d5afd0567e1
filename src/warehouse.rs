use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::mapper::ColumnType;

/// One extracted row, keyed by column name. Rows are serialized as-is into
/// the warehouse JSON load path.
pub type Row = Map<String, Value>;

/// System columns appended to every destination table, in fixed order.
pub const TENANT_ID_COL: &str = "tenant_id";
pub const SYNC_TIMESTAMP_COL: &str = "sync_timestamp";
pub const SYNC_MODE_COL: &str = "sync_mode";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Physical layout options applied at table creation time. Staging tables
/// use the default (no partitioning, no clustering).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub partition_day_field: Option<String>,
    pub clustering: Vec<String>,
}

/// The warehouse operations the sync core needs. The production
/// implementation lives in `bigquery.rs`; tests substitute an in-memory
/// recorder.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if absent. The location is fixed at client
    /// construction and never mutated afterwards.
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), SyncError>;

    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, SyncError>;

    async fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &[ColumnSchema],
        options: &TableOptions,
    ) -> Result<(), SyncError>;

    /// Append rows to an existing table. Implementations return only after
    /// the batch is committed and visible to subsequent queries and DML;
    /// the applier runs MERGE against staging tables immediately after
    /// loading them.
    async fn load_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
    ) -> Result<(), SyncError>;

    /// Run a DML statement (DELETE, MERGE) to completion.
    async fn run_query(&self, sql: &str) -> Result<(), SyncError>;

    async fn delete_table(&self, dataset: &str, table: &str) -> Result<(), SyncError>;
}
