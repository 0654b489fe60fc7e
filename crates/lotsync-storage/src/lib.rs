//! Persistence + transport utilities for lotsync: the `Store` seam with its
//! PostgreSQL and in-memory implementations, the retry policy, the HTTP
//! fetcher and the single-instance run lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotsync_core::{OperationRecord, ProcessedRecord, RawRecord, SyncWatermark};
use thiserror::Error;

pub mod http;
pub mod lock;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use http::{classify_reqwest_error, classify_status, FetchError, HttpClientConfig, HttpFetcher};
pub use lock::{LockError, RunLock};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{RetryDisposition, RetryObserver, RetryPolicy};

pub const CRATE_NAME: &str = "lotsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("raw record {0} already exists")]
    DuplicateRaw(String),
    #[error("raw record {0} does not exist")]
    MissingRaw(String),
    #[error("commit rejected: {0}")]
    CommitRejected(String),
}

/// One mutation of the raw store, staged by the change applier or the bulk
/// loader and committed together with the rest of its page.
#[derive(Debug, Clone, PartialEq)]
pub enum RawWrite {
    /// First sight of an id. The store assigns `seq`.
    Insert(RawRecord),
    /// Replace the mutable columns of an existing id.
    Update(RawRecord),
}

impl RawWrite {
    pub fn external_id(&self) -> &str {
        match self {
            Self::Insert(record) | Self::Update(record) => &record.external_id,
        }
    }
}

/// A normalized row plus the raw row version it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedProjection {
    pub raw_seq: i64,
    /// `last_touched_at` of the raw row when it was read.
    pub raw_touched_at: DateTime<Utc>,
    pub record: ProcessedRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizedCommit {
    pub created: usize,
    pub updated: usize,
    /// Projections dropped because their raw row changed after it was read.
    pub stale: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub raw_total: u64,
    pub raw_unprocessed: u64,
    pub raw_inactive: u64,
    pub processed_total: u64,
}

/// Durable state owned by the sync engine.
///
/// `commit_raw_page` and `commit_normalized_batch` are all-or-nothing: on
/// error none of their writes are visible.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_raw(&self, external_ids: &[String]) -> Result<Vec<RawRecord>, StoreError>;

    async fn get_raw(&self, external_id: &str) -> Result<Option<RawRecord>, StoreError>;

    async fn commit_raw_page(&self, writes: Vec<RawWrite>) -> Result<(), StoreError>;

    /// Unprocessed raw records with `seq > after_seq`, ascending by `seq`.
    async fn fetch_unprocessed(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError>;

    async fn count_unprocessed(&self) -> Result<u64, StoreError>;

    /// Upsert every projection by `external_id` and mark its raw row processed.
    ///
    /// A projection whose raw row was touched after `raw_touched_at` is
    /// skipped and counted as stale; that raw row stays unprocessed.
    async fn commit_normalized_batch(
        &self,
        staged: Vec<StagedProjection>,
    ) -> Result<NormalizedCommit, StoreError>;

    async fn get_processed(&self, external_id: &str)
        -> Result<Option<ProcessedRecord>, StoreError>;

    async fn load_watermark(&self) -> Result<Option<SyncWatermark>, StoreError>;

    async fn save_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError>;

    async fn append_operation(&self, record: &OperationRecord) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
