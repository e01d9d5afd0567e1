use thiserror::Error;

/// Failure taxonomy for a sync run. `Config` aborts the whole run; everything
/// else is recorded against the (tenant, table) pair it happened on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source database error: {0}")]
    Source(#[from] sqlx::Error),

    #[error("schema discovery failed for `{tenant}`.`{table}`: {message}")]
    SchemaDiscovery {
        tenant: String,
        table: String,
        message: String,
    },

    #[error("warehouse job failed: {message}")]
    Warehouse { message: String, transient: bool },

    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] std::io::Error),
}

impl SyncError {
    /// Transient classes are retried up to `max_retries`; schema discovery
    /// and checkpoint failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Source(_) => true,
            SyncError::Warehouse { transient, .. } => *transient,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let e = SyncError::Warehouse {
            message: "backendError".into(),
            transient: true,
        };
        assert!(e.is_retryable());

        let e = SyncError::Warehouse {
            message: "invalidQuery".into(),
            transient: false,
        };
        assert!(!e.is_retryable());

        let e = SyncError::SchemaDiscovery {
            tenant: "t1".into(),
            table: "orders".into(),
            message: "denied".into(),
        };
        assert!(!e.is_retryable());

        assert!(!SyncError::Config("missing params.json".into()).is_retryable());
    }
}
