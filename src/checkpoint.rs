use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::mapper::iso_datetime;
use crate::sync::SyncMode;

pub const LEGACY_BACKUP_DIR: &str = "backup_single_table_files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub table_name: String,
    pub last_sync_time: Option<String>,
    pub sync_status: String,
    pub sync_mode: String,
    #[serde(default)]
    pub records_synced: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub tenant_id: String,
    pub last_updated: String,
    #[serde(default)]
    pub total_tables: usize,
}

/// On-disk shape of `<status_dir>/<tenant>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStatus {
    pub database_info: DatabaseInfo,
    #[serde(default)]
    pub tables: BTreeMap<String, TableStatus>,
}

impl TenantStatus {
    fn new(tenant: &str) -> Self {
        Self {
            database_info: DatabaseInfo {
                tenant_id: tenant.to_string(),
                last_updated: iso_datetime(&Local::now().naive_local()),
                total_tables: 0,
            },
            tables: BTreeMap::new(),
        }
    }
}

/// Durable per-(tenant, table) sync state, one JSON file per tenant. A single
/// process-wide mutex serializes every read-modify-write.
pub struct CheckpointStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    // A poisoned lock only means another table's update panicked mid-write;
    // the files on disk are still consistent thanks to the atomic rename.
    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tenant_file(&self, tenant: &str) -> PathBuf {
        self.dir.join(format!("{}.json", tenant))
    }

    fn load_tenant(&self, tenant: &str) -> Option<TenantStatus> {
        let path = self.tenant_file(tenant);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match serde_json::from_str(&raw) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Unreadable checkpoint file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save_tenant(&self, tenant: &str, status: &TenantStatus) -> Result<(), SyncError> {
        let path = self.tenant_file(tenant);
        let tmp = self.dir.join(format!("{}.json.tmp", tenant));
        let body = serde_json::to_vec_pretty(status).map_err(std::io::Error::from)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Missing file, missing table entry, or an unparseable timestamp all
    /// degrade to `None`; the caller then runs a full sync.
    pub fn last_sync_time(&self, tenant: &str, table: &str) -> Option<NaiveDateTime> {
        let _guard = self.guard();
        let status = self.load_tenant(tenant)?;
        let raw = status.tables.get(table)?.last_sync_time.clone()?;
        match raw.parse::<NaiveDateTime>() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(
                    "Cannot parse last_sync_time for {}.{} ({:?}): {}",
                    tenant, table, raw, e
                );
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        tenant: &str,
        table: &str,
        sync_time: NaiveDateTime,
        sync_mode: SyncMode,
        records_synced: u64,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<(), SyncError> {
        let _guard = self.guard();
        let now = iso_datetime(&Local::now().naive_local());

        let mut tenant_status = self
            .load_tenant(tenant)
            .unwrap_or_else(|| TenantStatus::new(tenant));

        tenant_status.tables.insert(
            table.to_string(),
            TableStatus {
                table_name: table.to_string(),
                last_sync_time: Some(iso_datetime(&sync_time)),
                sync_status: status.as_str().to_string(),
                sync_mode: sync_mode.as_str().to_string(),
                records_synced,
                error_message: error_message.map(str::to_string),
                updated_at: now.clone(),
            },
        );
        tenant_status.database_info.last_updated = now;
        tenant_status.database_info.total_tables = tenant_status.tables.len();

        self.save_tenant(tenant, &tenant_status)
    }

    /// Merge predecessor `<tenant>_<table>.json` files into the tenant-grouped
    /// layout and move the originals aside. Tenants are assumed
    /// underscore-free; table names may contain underscores. Returns the
    /// number of table entries migrated.
    pub fn migrate_legacy_layout(&self) -> Result<usize, SyncError> {
        let _guard = self.guard();

        let mut legacy_files: Vec<(PathBuf, String, String)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if let Some((tenant, table)) = stem.split_once('_') {
                if !tenant.is_empty() && !table.is_empty() {
                    legacy_files.push((path.clone(), tenant.to_string(), table.to_string()));
                }
            }
        }

        if legacy_files.is_empty() {
            return Ok(0);
        }
        info!("Migrating {} single-table status files", legacy_files.len());

        let mut migrated = 0usize;
        let mut moved: Vec<PathBuf> = Vec::new();
        for (path, tenant, table) in &legacy_files {
            let parsed: Option<TableStatus> = fs::read_to_string(path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());
            let legacy = match parsed {
                Some(legacy) => legacy,
                None => {
                    warn!("Skipping malformed status file {}", path.display());
                    continue;
                }
            };

            let mut tenant_status = self
                .load_tenant(tenant)
                .unwrap_or_else(|| TenantStatus::new(tenant));
            // Existing grouped entries win over legacy ones.
            if !tenant_status.tables.contains_key(table) {
                tenant_status.tables.insert(table.clone(), legacy);
                tenant_status.database_info.total_tables = tenant_status.tables.len();
                tenant_status.database_info.last_updated =
                    iso_datetime(&Local::now().naive_local());
                self.save_tenant(tenant, &tenant_status)?;
                migrated += 1;
            }
            moved.push(path.clone());
        }

        let backup_dir = self.dir.join(LEGACY_BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;
        for path in moved {
            if let Some(name) = path.file_name() {
                if let Err(e) = fs::rename(&path, backup_dir.join(name)) {
                    warn!("Cannot move {} to backup: {}", path.display(), e);
                }
            }
        }

        info!("Migrated {} table entries into tenant-grouped files", migrated);
        Ok(migrated)
    }
}
