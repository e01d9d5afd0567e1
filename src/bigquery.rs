use async_trait::async_trait;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::clustering::Clustering;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::table::Table;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_schema::TableSchema;
use gcp_bigquery_client::model::time_partitioning::TimePartitioning;
use gcp_bigquery_client::Client;
use log::info;

use crate::error::SyncError;
use crate::mapper::ColumnType;
use crate::warehouse::{ColumnSchema, Row, TableOptions, Warehouse};

/// BigQuery-backed implementation of the warehouse interface. All project
/// and location settings are fixed at construction.
pub struct BigQueryWarehouse {
    client: Client,
    project: String,
    location: String,
    insert_chunk: usize,
}

impl BigQueryWarehouse {
    pub async fn connect(
        key_file: &str,
        project: &str,
        location: &str,
        insert_chunk: usize,
    ) -> Result<Self, SyncError> {
        let client = Client::from_service_account_key_file(key_file)
            .await
            .map_err(warehouse_err)?;
        Ok(Self {
            client,
            project: project.to_string(),
            location: location.to_string(),
            insert_chunk: insert_chunk.max(1),
        })
    }
}

fn field_schema(column: &ColumnSchema) -> TableFieldSchema {
    let name = column.name.as_str();
    match column.column_type {
        ColumnType::Int64 => TableFieldSchema::integer(name),
        ColumnType::Numeric => TableFieldSchema::numeric(name),
        ColumnType::Float64 => TableFieldSchema::float(name),
        ColumnType::String => TableFieldSchema::string(name),
        ColumnType::Date => TableFieldSchema::date(name),
        ColumnType::Timestamp => TableFieldSchema::timestamp(name),
        ColumnType::Bytes => TableFieldSchema::bytes(name),
        ColumnType::Boolean => TableFieldSchema::bool(name),
    }
}

/// Keeps each INSERT statement comfortably inside the query length cap.
const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// JSON-array payloads for one batch, bounded by row count and payload size.
fn batch_payloads(rows: &[Row], max_rows: usize) -> Result<Vec<String>, SyncError> {
    let max_rows = max_rows.max(1);
    let mut payloads = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;
    for row in rows {
        let encoded = serde_json::to_string(row).map_err(|e| SyncError::Warehouse {
            transient: false,
            message: format!("cannot encode row: {}", e),
        })?;
        if !current.is_empty()
            && (current.len() >= max_rows || current_len + encoded.len() > MAX_PAYLOAD_BYTES)
        {
            payloads.push(format!("[{}]", current.join(",")));
            current.clear();
            current_len = 0;
        }
        current_len += encoded.len() + 1;
        current.push(encoded);
    }
    if !current.is_empty() {
        payloads.push(format!("[{}]", current.join(",")));
    }
    Ok(payloads)
}

/// Pulls one typed column out of a JSON-encoded row.
fn select_expression(column: &ColumnSchema) -> String {
    let value = format!("JSON_VALUE(r, '$.\"{}\"')", column.name);
    match column.column_type {
        ColumnType::String => value,
        ColumnType::Int64 => format!("CAST({} AS INT64)", value),
        ColumnType::Numeric => format!("CAST({} AS NUMERIC)", value),
        ColumnType::Float64 => format!("CAST({} AS FLOAT64)", value),
        ColumnType::Date => format!("CAST({} AS DATE)", value),
        ColumnType::Timestamp => format!("CAST({} AS TIMESTAMP)", value),
        ColumnType::Bytes => format!("FROM_BASE64({})", value),
        ColumnType::Boolean => format!("CAST({} AS BOOL)", value),
    }
}

fn insert_statement(target: &str, schema: &[ColumnSchema], payload: &str) -> String {
    let columns: Vec<String> = schema.iter().map(|c| format!("`{}`", c.name)).collect();
    let expressions: Vec<String> = schema.iter().map(select_expression).collect();
    format!(
        "INSERT INTO {target} ({columns}) SELECT {expressions} \
         FROM UNNEST(JSON_EXTRACT_ARRAY({payload})) AS r",
        target = target,
        columns = columns.join(", "),
        expressions = expressions.join(", "),
        payload = sql_string_literal(payload)
    )
}

fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn is_transient(e: &BQError) -> bool {
    if matches!(e, BQError::RequestError(_)) {
        return true;
    }
    let message = e.to_string();
    [
        "backendError",
        "internalError",
        "rateLimitExceeded",
        "quotaExceeded",
        "jobBackendError",
        "jobInternalError",
    ]
    .iter()
    .any(|marker| message.contains(marker))
}

fn warehouse_err(e: BQError) -> SyncError {
    SyncError::Warehouse {
        transient: is_transient(&e),
        message: e.to_string(),
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), SyncError> {
        if self.client.dataset().get(&self.project, dataset).await.is_ok() {
            return Ok(());
        }
        info!("Creating dataset {} in {}", dataset, self.location);
        self.client
            .dataset()
            .create(Dataset::new(&self.project, dataset).location(self.location.as_str()))
            .await
            .map_err(warehouse_err)?;
        Ok(())
    }

    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, SyncError> {
        Ok(self
            .client
            .table()
            .get(&self.project, dataset, table, None)
            .await
            .is_ok())
    }

    async fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &[ColumnSchema],
        options: &TableOptions,
    ) -> Result<(), SyncError> {
        let fields: Vec<TableFieldSchema> = schema.iter().map(field_schema).collect();
        let mut table_def = Table::new(
            self.project.as_str(),
            dataset,
            table,
            TableSchema::new(fields),
        );
        if let Some(field) = &options.partition_day_field {
            table_def = table_def.time_partitioning(TimePartitioning::per_day().field(field.as_str()));
        }
        if !options.clustering.is_empty() {
            table_def.clustering = Some(Clustering {
                fields: Some(options.clustering.clone()),
            });
        }
        self.client.table().create(table_def).await.map_err(warehouse_err)?;
        Ok(())
    }

    /// Rows are written with DML insert jobs, which return only after the
    /// batch is committed and queryable. Streamed rows would sit in a
    /// buffer that the later tenant DELETE and MERGE statements cannot
    /// touch, and this client's load jobs only read from Cloud Storage
    /// URIs, so inline batches go through the query-job path instead.
    async fn load_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[Row],
        schema: &[ColumnSchema],
    ) -> Result<(), SyncError> {
        if rows.is_empty() {
            return Ok(());
        }
        let target = format!("`{}.{}.{}`", self.project, dataset, table);
        for payload in batch_payloads(rows, self.insert_chunk)? {
            let sql = insert_statement(&target, schema, &payload);
            self.client
                .job()
                .query(&self.project, QueryRequest::new(sql))
                .await
                .map_err(warehouse_err)?;
        }
        Ok(())
    }

    async fn run_query(&self, sql: &str) -> Result<(), SyncError> {
        self.client
            .job()
            .query(&self.project, QueryRequest::new(sql))
            .await
            .map_err(warehouse_err)?;
        Ok(())
    }

    async fn delete_table(&self, dataset: &str, table: &str) -> Result<(), SyncError> {
        self.client
            .table()
            .delete(&self.project, dataset, table)
            .await
            .map_err(warehouse_err)?;
        Ok(())
    }
}
