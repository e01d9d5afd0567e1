use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use futures::future::join_all;
use log::{error, info, warn};
use sqlx::MySqlPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::analyzer::TableAnalyzer;
use crate::apply::Applier;
use crate::checkpoint::{CheckpointStore, SyncStatus};
use crate::config::SyncParams;
use crate::error::SyncError;
use crate::extract::Extractor;
use crate::normalize;
use crate::report::{RunReport, TableOutcome};
use crate::warehouse::Warehouse;

/// Tables within one tenant sync in parallel, but never more than this many
/// at once; the cap bounds source-pool and warehouse-side contention.
const MAX_TABLE_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "FULL",
            SyncMode::Incremental => "INCREMENTAL",
        }
    }
}

/// FULL when forced, when there is no prior checkpoint, or when the table
/// has no usable timestamp column; INCREMENTAL otherwise.
pub fn decide_mode(
    force_full: bool,
    last_sync: Option<NaiveDateTime>,
    timestamp_field: Option<&str>,
) -> SyncMode {
    if force_full || last_sync.is_none() || timestamp_field.is_none() {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    }
}

/// Ties the pipeline together: tenants strictly serial, tables parallel
/// within a tenant, one durable checkpoint write per table.
pub struct SyncEngine {
    analyzer: TableAnalyzer,
    extractor: Extractor,
    applier: Applier,
    checkpoints: CheckpointStore,
    params: SyncParams,
}

impl SyncEngine {
    pub fn new(
        params: SyncParams,
        pool: MySqlPool,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self, SyncError> {
        let analyzer = TableAnalyzer::new(pool.clone());
        let extractor = Extractor::new(pool, params.lookback_minutes);
        let applier = Applier::new(warehouse, &params.bq_project, &params.bq_dataset);
        let checkpoints = CheckpointStore::new(&params.status_dir)?;
        Ok(Self {
            analyzer,
            extractor,
            applier,
            checkpoints,
            params,
        })
    }

    /// One-shot cleanup of the predecessor one-file-per-table status layout.
    pub fn migrate_legacy_checkpoints(&self) -> Result<usize, SyncError> {
        self.checkpoints.migrate_legacy_layout()
    }

    pub async fn run(self: Arc<Self>, force_full: bool, cancel: CancellationToken) -> RunReport {
        let tenants = self.params.tenants();
        let tables = self.params.tables();
        let mut report = RunReport::new(tenants.len() * tables.len());

        info!(
            "Starting sync of {} tenants x {} tables ({})",
            tenants.len(),
            tables.len(),
            if force_full { "forced full" } else { "smart incremental" }
        );

        for tenant in &tenants {
            if cancel.is_cancelled() {
                info!("Shutdown requested, stopping before tenant {}", tenant);
                break;
            }
            info!("Processing tenant {}", tenant);
            let tenant_started = Instant::now();

            let cap = tables.len().clamp(1, MAX_TABLE_CONCURRENCY);
            let semaphore = Arc::new(Semaphore::new(cap));
            let mut handles = Vec::with_capacity(tables.len());
            for table in &tables {
                if cancel.is_cancelled() {
                    info!(
                        "Shutdown requested, not scheduling further tables for {}",
                        tenant
                    );
                    break;
                }
                let engine = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                let tenant = tenant.clone();
                let table = table.clone();
                handles.push((
                    table.clone(),
                    tokio::spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                return TableOutcome {
                                    tenant: tenant.clone(),
                                    table: table.clone(),
                                    sync_mode: SyncMode::Full,
                                    status: SyncStatus::Failed,
                                    records_synced: 0,
                                    error_message: Some(
                                        "scheduler semaphore closed".to_string(),
                                    ),
                                    duration: Duration::ZERO,
                                };
                            }
                        };
                        engine.sync_table(&tenant, &table, force_full).await
                    }),
                ));
            }

            let (tables_spawned, joins): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
            let mut tenant_records = 0u64;
            for (table, joined) in tables_spawned.into_iter().zip(join_all(joins).await) {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => TableOutcome {
                        tenant: tenant.clone(),
                        table,
                        sync_mode: SyncMode::Full,
                        status: SyncStatus::Failed,
                        records_synced: 0,
                        error_message: Some(format!("sync task aborted: {}", e)),
                        duration: Duration::ZERO,
                    },
                };
                if outcome.status == SyncStatus::Success {
                    tenant_records += outcome.records_synced;
                }
                report.record(outcome);
            }
            info!(
                "Tenant {} done: {} rows in {:.1}s",
                tenant,
                tenant_records,
                tenant_started.elapsed().as_secs_f64()
            );
        }

        report
    }

    /// Runs one (tenant, table) pair to completion. Never propagates: any
    /// failure is folded into the outcome and the FAILED checkpoint.
    async fn sync_table(&self, tenant: &str, table: &str, force_full: bool) -> TableOutcome {
        let started = Instant::now();
        // Captured once; this exact instant becomes the checkpoint on success.
        let t_now = Local::now().naive_local();
        let mut mode = SyncMode::Full;

        match self
            .sync_table_inner(tenant, table, force_full, t_now, &mut mode)
            .await
        {
            Ok(records) => {
                if let Err(e) = self.checkpoints.update(
                    tenant,
                    table,
                    t_now,
                    mode,
                    records,
                    SyncStatus::Success,
                    None,
                ) {
                    // The next run simply re-syncs the window.
                    error!("Cannot persist checkpoint for {}.{}: {}", tenant, table, e);
                }
                info!(
                    "Synced {}.{}: {} rows ({})",
                    tenant,
                    table,
                    records,
                    mode.as_str()
                );
                TableOutcome {
                    tenant: tenant.to_string(),
                    table: table.to_string(),
                    sync_mode: mode,
                    status: SyncStatus::Success,
                    records_synced: records,
                    error_message: None,
                    duration: started.elapsed(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!("Sync failed for {}.{}: {}", tenant, table, message);
                if let Err(ce) = self.checkpoints.update(
                    tenant,
                    table,
                    t_now,
                    mode,
                    0,
                    SyncStatus::Failed,
                    Some(&message),
                ) {
                    error!("Cannot persist failure for {}.{}: {}", tenant, table, ce);
                }
                TableOutcome {
                    tenant: tenant.to_string(),
                    table: table.to_string(),
                    sync_mode: mode,
                    status: SyncStatus::Failed,
                    records_synced: 0,
                    error_message: Some(message),
                    duration: started.elapsed(),
                }
            }
        }
    }

    async fn sync_table_inner(
        &self,
        tenant: &str,
        table: &str,
        force_full: bool,
        t_now: NaiveDateTime,
        mode_out: &mut SyncMode,
    ) -> Result<u64, SyncError> {
        let info = self.analyzer.table_info(tenant, table).await?;

        self.with_retry("destination setup", tenant, table, || async {
            self.applier.ensure_dataset().await?;
            self.applier.ensure_table(table, &info.schema).await
        })
        .await?;

        let last = if force_full {
            None
        } else {
            self.checkpoints.last_sync_time(tenant, table)
        };

        let mode = decide_mode(force_full, last, info.timestamp_field.as_deref());
        *mode_out = mode;
        match (mode, last) {
            (SyncMode::Incremental, Some(last)) => {
                info!("Incremental sync of {}.{} since {}", tenant, table, last)
            }
            _ => info!(
                "Full sync of {}.{} ({})",
                tenant,
                table,
                if force_full {
                    "forced"
                } else if last.is_none() {
                    "no prior checkpoint"
                } else {
                    "no timestamp field"
                }
            ),
        }

        let rows = self
            .with_retry("extraction", tenant, table, || {
                self.extractor.fetch(tenant, table, &info, mode, last, t_now)
            })
            .await?;

        if rows.is_empty() {
            info!("No rows to sync for {}.{}", tenant, table);
            return Ok(0);
        }

        let batch = normalize::normalize_batch(rows, &info.field_types);
        let records = batch.rows.len() as u64;

        self.with_retry("warehouse write", tenant, table, || {
            self.applier
                .write(table, &batch.rows, &info.schema, &info.primary_keys, mode)
        })
        .await?;

        Ok(records)
    }

    /// Bounded retry with a fixed delay, applied only to transient errors.
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        tenant: &str,
        table: &str,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.params.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} failed for {}.{} (attempt {}/{}): {}; retrying in {}s",
                        what,
                        tenant,
                        table,
                        attempt,
                        self.params.max_retries,
                        e,
                        self.params.retry_delay
                    );
                    tokio::time::sleep(Duration::from_secs(self.params.retry_delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn some_instant() -> Option<NaiveDateTime> {
        Some(
            NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn first_run_is_full() {
        assert_eq!(decide_mode(false, None, Some("updated_at")), SyncMode::Full);
    }

    #[test]
    fn missing_timestamp_field_downgrades_to_full() {
        assert_eq!(decide_mode(false, some_instant(), None), SyncMode::Full);
    }

    #[test]
    fn force_flag_wins_over_checkpoint() {
        assert_eq!(
            decide_mode(true, some_instant(), Some("updated_at")),
            SyncMode::Full
        );
    }

    #[test]
    fn checkpoint_plus_timestamp_is_incremental() {
        assert_eq!(
            decide_mode(false, some_instant(), Some("updated_at")),
            SyncMode::Incremental
        );
    }

    #[test]
    fn mode_labels() {
        assert_eq!(SyncMode::Full.as_str(), "FULL");
        assert_eq!(SyncMode::Incremental.as_str(), "INCREMENTAL");
    }
}
