//! In-process `Store` used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lotsync_core::{OperationRecord, ProcessedRecord, RawRecord, SyncWatermark};
use tokio::sync::Mutex;

use crate::{NormalizedCommit, RawWrite, StagedProjection, Store, StoreError, StoreStats};

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: i64,
    raw: BTreeMap<i64, RawRecord>,
    raw_index: HashMap<String, i64>,
    processed: HashMap<String, ProcessedRecord>,
    watermark: Option<SyncWatermark>,
    operations: Vec<OperationRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` page/batch commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        let armed = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match armed {
            Ok(_) => Err(StoreError::CommitRejected("injected commit failure".into())),
            Err(_) => Ok(()),
        }
    }

    pub async fn raw_records(&self) -> Vec<RawRecord> {
        self.state.lock().await.raw.values().cloned().collect()
    }

    pub async fn operations(&self) -> Vec<OperationRecord> {
        self.state.lock().await.operations.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_raw(&self, external_ids: &[String]) -> Result<Vec<RawRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        Ok(external_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| state.raw_index.get(id))
            .filter_map(|seq| state.raw.get(seq).cloned())
            .collect())
    }

    async fn get_raw(&self, external_id: &str) -> Result<Option<RawRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .raw_index
            .get(external_id)
            .and_then(|seq| state.raw.get(seq).cloned()))
    }

    async fn commit_raw_page(&self, writes: Vec<RawWrite>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.take_injected_failure()?;

        let mut inserted = HashSet::new();
        for write in &writes {
            let id = write.external_id();
            let exists = state.raw_index.contains_key(id) || inserted.contains(id);
            match write {
                RawWrite::Insert(_) if exists => return Err(StoreError::DuplicateRaw(id.into())),
                RawWrite::Insert(_) => {
                    inserted.insert(id);
                }
                RawWrite::Update(_) if !exists => return Err(StoreError::MissingRaw(id.into())),
                RawWrite::Update(_) => {}
            }
        }

        for write in writes {
            match write {
                RawWrite::Insert(mut record) => {
                    state.next_seq += 1;
                    record.seq = state.next_seq;
                    state.raw_index.insert(record.external_id.clone(), record.seq);
                    state.raw.insert(record.seq, record);
                }
                RawWrite::Update(mut record) => {
                    let seq = state.raw_index[&record.external_id];
                    let current = &state.raw[&seq];
                    record.seq = seq;
                    record.ingested_at = current.ingested_at;
                    record.ingestion_source = current.ingestion_source;
                    state.raw.insert(seq, record);
                }
            }
        }
        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .raw
            .range(after_seq.saturating_add(1)..)
            .map(|(_, record)| record)
            .filter(|record| !record.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_unprocessed(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.raw.values().filter(|r| !r.processed).count() as u64)
    }

    async fn commit_normalized_batch(
        &self,
        staged: Vec<StagedProjection>,
    ) -> Result<NormalizedCommit, StoreError> {
        let mut state = self.state.lock().await;
        self.take_injected_failure()?;

        if let Some(missing) = staged.iter().find(|s| !state.raw.contains_key(&s.raw_seq)) {
            return Err(StoreError::MissingRaw(missing.record.external_id.clone()));
        }

        let mut commit = NormalizedCommit::default();
        for StagedProjection {
            raw_seq,
            raw_touched_at,
            record,
        } in staged
        {
            match state.raw.get_mut(&raw_seq) {
                Some(raw) if raw.last_touched_at == raw_touched_at => raw.processed = true,
                _ => {
                    commit.stale += 1;
                    continue;
                }
            }
            match state.processed.insert(record.external_id.clone(), record) {
                Some(_) => commit.updated += 1,
                None => commit.created += 1,
            }
        }
        Ok(commit)
    }

    async fn get_processed(
        &self,
        external_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        Ok(self.state.lock().await.processed.get(external_id).cloned())
    }

    async fn load_watermark(&self) -> Result<Option<SyncWatermark>, StoreError> {
        Ok(self.state.lock().await.watermark.clone())
    }

    async fn save_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError> {
        self.state.lock().await.watermark = Some(watermark.clone());
        Ok(())
    }

    async fn append_operation(&self, record: &OperationRecord) -> Result<(), StoreError> {
        self.state.lock().await.operations.push(record.clone());
        Ok(())
    }

    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.operations.iter().rev().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.lock().await;
        Ok(StoreStats {
            raw_total: state.raw.len() as u64,
            raw_unprocessed: state.raw.values().filter(|r| !r.processed).count() as u64,
            raw_inactive: state.raw.values().filter(|r| !r.active).count() as u64,
            processed_total: state.processed.len() as u64,
        })
    }
}
