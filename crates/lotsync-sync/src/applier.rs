//! Applies one page of change-feed (or bulk listing) records to the raw store.
//!
//! Records are staged against an in-memory overlay of the page's existing
//! rows, so a later record in the same page sees the effect of an earlier
//! one. The staged writes are then committed as a single unit.

use std::collections::HashMap;
use std::ops::AddAssign;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use lotsync_adapters::ChangeRecord;
use lotsync_core::{merge_payload, ChangeKind, IngestionSource, RawRecord};
use lotsync_storage::{RawWrite, Store, StoreError};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeStats {
    pub loaded: usize,
    pub updated: usize,
    pub removed: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl ChangeStats {
    pub fn applied(&self) -> usize {
        self.loaded + self.updated + self.removed
    }
}

impl AddAssign for ChangeStats {
    fn add_assign(&mut self, other: Self) {
        self.loaded += other.loaded;
        self.updated += other.updated;
        self.removed += other.removed;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
    }
}

/// Why a single record in a page was not applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record has no external id")]
    MissingExternalId,
    #[error("record {external_id}: unknown change kind {kind:?}")]
    UnknownChangeKind { external_id: String, kind: String },
}

/// The page could not be committed; nothing from it was persisted.
#[derive(Debug, Error)]
#[error("page of {records} records was not committed: {source}")]
pub struct PageFailure {
    pub records: usize,
    /// Every record of the page counted as an error.
    pub stats: ChangeStats,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindMode {
    /// Honour each record's `change_type`; absent means `added`.
    FromRecord,
    /// Bulk listing: every record is a first sight.
    AllAdded,
}

struct Staged {
    record: RawRecord,
    persisted: bool,
    dirty: bool,
}

pub struct ChangeApplier<'a> {
    store: &'a dyn Store,
    source: IngestionSource,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(store: &'a dyn Store, source: IngestionSource) -> Self {
        Self { store, source }
    }

    /// Apply a change-feed page. Commits atomically or not at all.
    pub async fn apply_page(
        &self,
        records: &[ChangeRecord],
        now: DateTime<Utc>,
    ) -> Result<ChangeStats, PageFailure> {
        self.apply(records, now, KindMode::FromRecord).await
    }

    /// Apply a bulk listing page: unseen ids are created, seen ids skipped.
    pub async fn apply_listing_page(
        &self,
        records: &[ChangeRecord],
        now: DateTime<Utc>,
    ) -> Result<ChangeStats, PageFailure> {
        self.apply(records, now, KindMode::AllAdded).await
    }

    async fn apply(
        &self,
        records: &[ChangeRecord],
        now: DateTime<Utc>,
        mode: KindMode,
    ) -> Result<ChangeStats, PageFailure> {
        let failure = |source: StoreError| PageFailure {
            records: records.len(),
            stats: ChangeStats {
                errors: records.len(),
                ..Default::default()
            },
            source,
        };

        let mut ids: Vec<String> = records.iter().filter_map(ChangeRecord::external_id).collect();
        ids.sort();
        ids.dedup();

        let mut overlay: HashMap<String, Staged> = HashMap::new();
        if !ids.is_empty() {
            for record in self.store.find_raw(&ids).await.map_err(failure)? {
                overlay.insert(
                    record.external_id.clone(),
                    Staged {
                        record,
                        persisted: true,
                        dirty: false,
                    },
                );
            }
        }

        let mut stats = ChangeStats::default();
        let mut order: Vec<String> = Vec::new();
        for change in records {
            match self.stage(change, mode, now, &mut overlay, &mut order) {
                Ok(outcome) => outcome.count(&mut stats),
                Err(err) => {
                    warn!(error = %err, "change record skipped");
                    stats.errors += 1;
                }
            }
        }

        let writes: Vec<RawWrite> = order
            .iter()
            .filter_map(|id| overlay.remove(id))
            .filter(|staged| staged.dirty)
            .map(|staged| {
                if staged.persisted {
                    RawWrite::Update(staged.record)
                } else {
                    RawWrite::Insert(staged.record)
                }
            })
            .collect();

        if !writes.is_empty() {
            let count = writes.len();
            self.store.commit_raw_page(writes).await.map_err(failure)?;
            debug!(writes = count, "page committed");
        }
        Ok(stats)
    }

    fn stage(
        &self,
        change: &ChangeRecord,
        mode: KindMode,
        now: DateTime<Utc>,
        overlay: &mut HashMap<String, Staged>,
        order: &mut Vec<String>,
    ) -> Result<Outcome, RecordError> {
        let external_id = change.external_id().ok_or(RecordError::MissingExternalId)?;
        let kind = match (mode, change.change_kind.as_ref()) {
            (KindMode::AllAdded, _) | (KindMode::FromRecord, None | Some(JsonValue::Null)) => {
                ChangeKind::Added
            }
            (KindMode::FromRecord, Some(JsonValue::String(raw))) => raw
                .parse::<ChangeKind>()
                .map_err(|_| RecordError::UnknownChangeKind {
                    external_id: external_id.clone(),
                    kind: raw.clone(),
                })?,
            (KindMode::FromRecord, Some(other)) => {
                return Err(RecordError::UnknownChangeKind {
                    external_id,
                    kind: other.to_string(),
                })
            }
        };
        let created_at = parse_source_timestamp(change.created_at_text(), now);

        if let Some(staged) = overlay.get_mut(&external_id) {
            let record = &mut staged.record;
            let outcome = match kind {
                ChangeKind::Added => return Ok(Outcome::Duplicate),
                ChangeKind::Changed => {
                    merge_payload(&mut record.payload, &change.payload());
                    record.source_created_at = created_at;
                    Outcome::Updated
                }
                ChangeKind::Removed => {
                    record.active = false;
                    Outcome::Removed
                }
            };
            record.change_kind = kind;
            record.last_touched_at = now;
            record.processed = false;
            if !staged.dirty {
                staged.dirty = true;
                order.push(external_id);
            }
            return Ok(outcome);
        }

        let payload = match kind {
            ChangeKind::Removed => JsonValue::Object(Map::new()),
            _ => change.payload(),
        };
        let mut record =
            RawRecord::first_sight(external_id.clone(), kind, created_at, payload, self.source, now);
        record.active = kind != ChangeKind::Removed;
        overlay.insert(
            external_id.clone(),
            Staged {
                record,
                persisted: false,
                dirty: true,
            },
        );
        order.push(external_id);
        Ok(Outcome::Loaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Loaded,
    Updated,
    Removed,
    Duplicate,
}

impl Outcome {
    fn count(self, stats: &mut ChangeStats) {
        match self {
            Self::Loaded => stats.loaded += 1,
            Self::Updated => stats.updated += 1,
            Self::Removed => stats.removed += 1,
            Self::Duplicate => stats.duplicates += 1,
        }
    }
}

/// Source creation time from the wire. Offsets are honoured, naive values
/// are read as UTC; anything unparseable falls back to `now`.
pub fn parse_source_timestamp(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return now;
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return naive.and_utc();
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return midnight.and_utc();
    }
    now
}
