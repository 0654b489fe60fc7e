//! Operation ledger: one audit entry per top-level run.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lotsync_core::{OperationKind, OperationRecord, OperationStatus};
use lotsync_storage::{RetryPolicy, Store};
use tracing::{error, info};

/// Ledger writes are cheap; a short policy avoids holding up the exit.
pub fn ledger_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_secs(1),
        total_timeout: Duration::from_secs(10),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOperation {
    kind: OperationKind,
    started_at: DateTime<Utc>,
    clock: Instant,
}

pub struct OperationLedger<'a> {
    store: &'a dyn Store,
    retry: RetryPolicy,
}

impl<'a> OperationLedger<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            retry: ledger_retry_policy(),
        }
    }

    pub fn open(&self, kind: OperationKind) -> OpenOperation {
        info!(%kind, "operation started");
        OpenOperation {
            kind,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    /// Append the closing entry. A write that keeps failing is logged and
    /// swallowed; the returned record is what was (or would have been) stored.
    pub async fn close(
        &self,
        operation: OpenOperation,
        status: OperationStatus,
        detail: Option<String>,
    ) -> OperationRecord {
        let record = OperationRecord {
            kind: operation.kind,
            started_at: operation.started_at,
            duration_ms: i64::try_from(operation.clock.elapsed().as_millis()).unwrap_or(i64::MAX),
            status,
            detail,
        };

        let written = self
            .retry
            .run("operation_ledger", || self.store.append_operation(&record))
            .await;
        match written {
            Ok(()) => info!(
                kind = %record.kind,
                status = %record.status,
                duration_ms = record.duration_ms,
                "operation recorded"
            ),
            Err(err) => error!(
                kind = %record.kind,
                status = %record.status,
                error = %err,
                "failed to record operation"
            ),
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_storage::MemoryStore;

    #[tokio::test]
    async fn close_appends_one_entry() {
        let store = MemoryStore::new();
        let ledger = OperationLedger::new(&store);
        let op = ledger.open(OperationKind::Normalization);
        let record = ledger
            .close(op, OperationStatus::Error, Some("completed with 2 errors".into()))
            .await;

        let stored = store.operations().await;
        assert_eq!(stored, vec![record]);
        assert_eq!(stored[0].kind, OperationKind::Normalization);
        assert!(stored[0].duration_ms >= 0);
    }
}
