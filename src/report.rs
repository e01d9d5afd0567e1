use std::time::{Duration, Instant};

use log::info;

use crate::checkpoint::SyncStatus;
use crate::sync::SyncMode;

#[derive(Debug, Clone)]
pub struct TableOutcome {
    pub tenant: String,
    pub table: String,
    pub sync_mode: SyncMode,
    pub status: SyncStatus,
    pub records_synced: u64,
    pub error_message: Option<String>,
    pub duration: Duration,
}

/// Accumulates per-table outcomes for the end-of-run summary.
pub struct RunReport {
    started: Instant,
    total_tables: usize,
    outcomes: Vec<TableOutcome>,
}

impl RunReport {
    pub fn new(total_tables: usize) -> Self {
        Self {
            started: Instant::now(),
            total_tables,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: TableOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[TableOutcome] {
        &self.outcomes
    }

    pub fn success_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SyncStatus::Success)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SyncStatus::Failed)
            .count()
    }

    pub fn full_sync_count(&self) -> usize {
        self.successes_with_mode(SyncMode::Full)
    }

    pub fn incremental_sync_count(&self) -> usize {
        self.successes_with_mode(SyncMode::Incremental)
    }

    fn successes_with_mode(&self, mode: SyncMode) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SyncStatus::Success && o.sync_mode == mode)
            .count()
    }

    pub fn total_records(&self) -> u64 {
        self.outcomes
            .iter()
            .filter(|o| o.status == SyncStatus::Success)
            .map(|o| o.records_synced)
            .sum()
    }

    pub fn log_summary(&self) {
        let elapsed = self.started.elapsed();
        info!("==== Sync run summary ====");
        info!("Tables scheduled: {}", self.total_tables);
        info!(
            "Succeeded: {}, failed: {}",
            self.success_count(),
            self.failed_count()
        );
        info!(
            "Full syncs: {}, incremental syncs: {}",
            self.full_sync_count(),
            self.incremental_sync_count()
        );
        info!("Records synced: {}", self.total_records());
        info!("Elapsed: {:.2}s", elapsed.as_secs_f64());
        if self.total_records() > 0 && elapsed.as_secs_f64() > 0.0 {
            info!(
                "Throughput: {:.1} rows/sec",
                self.total_records() as f64 / elapsed.as_secs_f64()
            );
        }
        if self.failed_count() > 0 {
            info!("Failed tables:");
            for outcome in self.outcomes.iter().filter(|o| o.status == SyncStatus::Failed) {
                info!(
                    "  {}.{}: {}",
                    outcome.tenant,
                    outcome.table,
                    outcome.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}
