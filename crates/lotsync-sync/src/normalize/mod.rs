//! Normalization pipeline: unprocessed raw records in, processed records out.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use lotsync_core::{OperationStatus, ProcessedRecord, RawRecord, Translator};
use lotsync_storage::{StagedProjection, Store};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::RunReport;

pub mod extract;

pub use extract::{extract_fields, extract_listing, validate, ExtractError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    /// Records re-ingested mid-run; left for the next run.
    pub stale: usize,
    pub batches: usize,
}

impl RunReport for NormalizeStats {
    fn status(&self) -> OperationStatus {
        if self.errors > 0 {
            OperationStatus::Error
        } else {
            OperationStatus::Ok
        }
    }

    fn detail(&self) -> String {
        let mut head = format!(
            "processed={} created={} updated={} errors={} batches={}",
            self.processed, self.created, self.updated, self.errors, self.batches
        );
        if self.stale > 0 {
            head.push_str(&format!(" stale={}", self.stale));
        }
        if self.errors > 0 {
            format!("{head}; completed with {} errors", self.errors)
        } else {
            head
        }
    }
}

/// Per-record result within a batch.
#[derive(Debug)]
pub enum RecordOutcome {
    Staged(StagedProjection),
    Rejected {
        external_id: String,
        error: ExtractError,
    },
}

/// Turn one raw record into a staged projection or a rejection.
pub fn normalize_record(
    raw: &RawRecord,
    translator: &dyn Translator,
    now: DateTime<Utc>,
) -> RecordOutcome {
    match extract_listing(&raw.external_id, &raw.payload, translator, now.year()) {
        Ok(fields) => RecordOutcome::Staged(StagedProjection {
            raw_seq: raw.seq,
            raw_touched_at: raw.last_touched_at,
            record: ProcessedRecord {
                external_id: raw.external_id.clone(),
                active: raw.active,
                source_created_at: raw.source_created_at,
                fields,
                updated_at: now,
            },
        }),
        Err(error) => RecordOutcome::Rejected {
            external_id: raw.external_id.clone(),
            error,
        },
    }
}

pub struct Normalizer<'a> {
    store: &'a dyn Store,
    translator: &'a dyn Translator,
    batch_size: usize,
}

impl<'a> Normalizer<'a> {
    pub fn new(store: &'a dyn Store, translator: &'a dyn Translator, batch_size: usize) -> Self {
        Self {
            store,
            translator,
            batch_size: batch_size.max(1),
        }
    }

    /// Process unprocessed records in sequence order until none remain or
    /// `limit` records have been consumed.
    ///
    /// Rejected records stay unprocessed. The scan moves forward by sequence
    /// so a rejected record is not revisited within the same run.
    pub async fn run(&self, limit: Option<usize>) -> Result<NormalizeStats> {
        let mut stats = NormalizeStats::default();

        let pending = self
            .store
            .count_unprocessed()
            .await
            .context("counting unprocessed records")?;
        if pending == 0 {
            info!("no unprocessed records");
            return Ok(stats);
        }
        match limit {
            Some(limit) if (limit as u64) < pending => {
                info!(pending, limit, "normalizing up to limit")
            }
            _ => info!(pending, "normalizing unprocessed records"),
        }

        let mut after_seq = 0i64;
        let mut consumed = 0usize;
        loop {
            let take = match limit {
                Some(limit) if consumed >= limit => {
                    info!(limit, "record limit reached");
                    break;
                }
                Some(limit) => self.batch_size.min(limit - consumed),
                None => self.batch_size,
            };

            let batch = self
                .store
                .fetch_unprocessed(after_seq, take)
                .await
                .context("fetching unprocessed batch")?;
            let Some(last) = batch.last() else {
                break;
            };
            after_seq = last.seq;
            consumed += batch.len();
            stats.batches += 1;

            self.process_batch(&batch, &mut stats).await;
            info!(
                batch = stats.batches,
                processed = stats.processed,
                errors = stats.errors,
                consumed,
                pending,
                "normalization batch done"
            );
        }

        info!(
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            errors = stats.errors,
            stale = stats.stale,
            batches = stats.batches,
            "normalization finished"
        );
        Ok(stats)
    }

    async fn process_batch(&self, batch: &[RawRecord], stats: &mut NormalizeStats) {
        let now = Utc::now();
        let mut staged = Vec::with_capacity(batch.len());
        let mut rejected = 0usize;

        for raw in batch {
            match normalize_record(raw, self.translator, now) {
                RecordOutcome::Staged(projection) => staged.push(projection),
                RecordOutcome::Rejected { external_id, error } => {
                    warn!(%external_id, error = %error, "record rejected by validation");
                    rejected += 1;
                }
            }
        }
        stats.errors += rejected;

        if staged.is_empty() {
            return;
        }
        let staged_count = staged.len();
        match self.store.commit_normalized_batch(staged).await {
            Ok(commit) => {
                stats.processed += staged_count - commit.stale;
                stats.created += commit.created;
                stats.updated += commit.updated;
                stats.stale += commit.stale;
                if commit.stale > 0 {
                    warn!(stale = commit.stale, "raw records changed during normalization; left unprocessed");
                }
                debug!(created = commit.created, updated = commit.updated, "batch committed");
            }
            Err(err) => {
                // Nothing from the batch persisted: every staged record stays
                // unprocessed and counts as an error alongside the rejections.
                error!(records = batch.len(), error = %err, "batch commit failed");
                stats.errors += staged_count;
            }
        }
    }
}
