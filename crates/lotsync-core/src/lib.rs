//! Core domain model for lotsync: raw change-feed records, their normalized
//! projection, the sync watermark and the operation ledger entries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod merge;
pub mod translate;

pub use merge::{merge_payload, DELTA_PREFIX};
pub use translate::{translate_json, DictionaryTranslator, IdentityTranslator, Translator};

pub const CRATE_NAME: &str = "lotsync-core";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Last known mutation applied to a raw record by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "added" => Ok(Self::Added),
            "changed" => Ok(Self::Changed),
            "removed" => Ok(Self::Removed),
            other => Err(ParseEnumError {
                kind: "change kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Provenance tag of a raw record. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionSource {
    Bulk,
    Incremental,
}

impl IngestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bulk => "bulk",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for IngestionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "bulk" => Ok(Self::Bulk),
            "incremental" => Ok(Self::Incremental),
            other => Err(ParseEnumError {
                kind: "ingestion source",
                value: other.to_string(),
            }),
        }
    }
}

/// One ingested upstream record, stored verbatim and keyed by `external_id`.
///
/// `seq` is the store-assigned internal sequence; it orders normalization
/// batches and is `0` until the record has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub seq: i64,
    pub external_id: String,
    pub change_kind: ChangeKind,
    pub source_created_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub ingested_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub ingestion_source: IngestionSource,
    pub active: bool,
    pub processed: bool,
}

impl RawRecord {
    /// A freshly seen record: active, waiting for normalization.
    pub fn first_sight(
        external_id: impl Into<String>,
        change_kind: ChangeKind,
        source_created_at: DateTime<Utc>,
        payload: JsonValue,
        ingestion_source: IngestionSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            external_id: external_id.into(),
            change_kind,
            source_created_at,
            payload,
            ingested_at: now,
            last_touched_at: now,
            ingestion_source,
            active: true,
            processed: false,
        }
    }
}

/// One whitelisted configuration parameter kept on the normalized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParam {
    pub name: String,
    pub value: String,
}

/// Typed attributes extracted from a raw payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingFields {
    pub url: Option<String>,
    pub mark: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub color: Option<String>,
    pub price: Option<i64>,
    pub km_age: Option<i64>,
    pub engine_type: Option<String>,
    pub transmission_type: Option<String>,
    pub body_type: Option<String>,
    pub address: Option<String>,
    pub section: Option<String>,
    pub offer_created: Option<NaiveDate>,
    pub description: Option<String>,
    pub displacement: Option<f64>,
    pub vin: Option<String>,
    pub first_registration: Option<NaiveDate>,
    pub power: Option<i32>,
    pub drive_type: Option<String>,
    pub images: Vec<String>,
    /// Translated option labels, de-duplicated in first-seen order.
    pub options: Vec<String>,
    /// Whitelisted parameters keyed by their numeric id rendered as a string.
    pub configuration: Option<BTreeMap<String, ConfigParam>>,
}

/// Normalized projection of one raw record. At most one per `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub external_id: String,
    pub active: bool,
    pub source_created_at: DateTime<Utc>,
    pub fields: ListingFields,
    pub updated_at: DateTime<Utc>,
}

/// Singleton high-water mark of fully drained processing units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub last_successful_date: NaiveDate,
    pub last_cursor: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    DataFetch,
    Normalization,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataFetch => "data_fetch",
            Self::Normalization => "normalization",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "data_fetch" => Ok(Self::DataFetch),
            "normalization" => Ok(Self::Normalization),
            other => Err(ParseEnumError {
                kind: "operation kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Ok,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "OK" => Ok(Self::Ok),
            "ERROR" => Ok(Self::Error),
            other => Err(ParseEnumError {
                kind: "operation status",
                value: other.to_string(),
            }),
        }
    }
}

/// Append-only audit entry for one top-level run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: OperationStatus,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_parses_wire_names() {
        assert_eq!("added".parse::<ChangeKind>(), Ok(ChangeKind::Added));
        assert_eq!(" removed ".parse::<ChangeKind>(), Ok(ChangeKind::Removed));
        let err = "moved".parse::<ChangeKind>().unwrap_err();
        assert_eq!(err.value, "moved");
    }

    #[test]
    fn operation_status_round_trips_through_ledger_strings() {
        for status in [OperationStatus::Ok, OperationStatus::Error] {
            assert_eq!(status.as_str().parse::<OperationStatus>(), Ok(status));
        }
        assert_eq!(
            "normalization".parse::<OperationKind>(),
            Ok(OperationKind::Normalization)
        );
    }

    #[test]
    fn first_sight_records_start_active_and_unprocessed() {
        let now = Utc::now();
        let record = RawRecord::first_sight(
            "abc",
            ChangeKind::Added,
            now,
            serde_json::json!({"price": 1}),
            IngestionSource::Incremental,
            now,
        );
        assert!(record.active);
        assert!(!record.processed);
        assert_eq!(record.ingested_at, record.last_touched_at);
    }
}
