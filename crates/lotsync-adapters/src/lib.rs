//! Upstream listing API contract + HTTP and fixture-backed implementations.

use async_trait::async_trait;
use chrono::NaiveDate;
use lotsync_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod http;
pub mod scripted;

pub use http::{ApiConfig, Endpoints, HttpListingApi};
pub use scripted::{load_fixture_script, FixtureScript, ScriptedListingApi, ScriptedReply};

pub const CRATE_NAME: &str = "lotsync-adapters";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {endpoint} response: {message}")]
    Shape {
        endpoint: &'static str,
        message: String,
    },
    #[error("scripted failure: {0}")]
    Scripted(String),
}

/// One record as delivered by the listing or change feed.
///
/// Every field is optional on the wire; the change applier decides what a
/// missing field means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default, rename = "inner_id")]
    pub external_id: Option<JsonValue>,
    #[serde(default, rename = "change_type")]
    pub change_kind: Option<JsonValue>,
    #[serde(default)]
    pub created_at: Option<JsonValue>,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

impl ChangeRecord {
    /// Identity key as text. Numbers are accepted; blanks are not.
    pub fn external_id(&self) -> Option<String> {
        match self.external_id.as_ref()? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Declared creation time, when the wire carries it as text.
    pub fn created_at_text(&self) -> Option<&str> {
        self.created_at.as_ref()?.as_str()
    }

    pub fn payload(&self) -> JsonValue {
        match &self.data {
            Some(value) if !value.is_null() => value.clone(),
            _ => JsonValue::Object(Default::default()),
        }
    }
}

/// One page of the bulk listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffersPage {
    pub items: Vec<ChangeRecord>,
    pub next_page: Option<u32>,
}

/// One page of the change feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesPage {
    pub items: Vec<ChangeRecord>,
    /// Cursor value the server actually answered for.
    pub served_cursor: Option<i64>,
    pub next_cursor: Option<i64>,
}

#[async_trait]
pub trait ListingApi: Send + Sync {
    async fn list_offers(&self, page: u32) -> Result<OffersPage, UpstreamError>;

    /// Initial change cursor for a calendar date; `None` when the date is empty.
    async fn change_cursor(&self, date: NaiveDate) -> Result<Option<i64>, UpstreamError>;

    async fn changes(&self, cursor: i64) -> Result<ChangesPage, UpstreamError>;

    async fn offer(&self, external_id: &str) -> Result<JsonValue, UpstreamError>;
}

fn json_i64(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn result_items(endpoint: &'static str, body: &JsonValue) -> Result<Vec<ChangeRecord>, UpstreamError> {
    if !body.is_object() {
        return Err(UpstreamError::Shape {
            endpoint,
            message: "body is not a JSON object".into(),
        });
    }
    let items = match body.get("result") {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items,
        Some(_) => {
            return Err(UpstreamError::Shape {
                endpoint,
                message: "`result` is not an array".into(),
            })
        }
    };
    // A non-object item becomes an id-less record so the page survives and
    // the applier counts it as a record error.
    Ok(items
        .iter()
        .map(|item| serde_json::from_value(item.clone()).unwrap_or_default())
        .collect())
}

pub fn parse_offers_page(body: &JsonValue) -> Result<OffersPage, UpstreamError> {
    let items = result_items("offers", body)?;
    let next_page = json_i64(body.pointer("/meta/next_page"))
        .and_then(|page| u32::try_from(page).ok());
    Ok(OffersPage { items, next_page })
}

pub fn parse_changes_page(body: &JsonValue) -> Result<ChangesPage, UpstreamError> {
    let items = result_items("changes", body)?;
    Ok(ChangesPage {
        items,
        served_cursor: json_i64(body.pointer("/meta/cur_change_id")),
        next_cursor: json_i64(body.pointer("/meta/next_change_id")),
    })
}

pub fn parse_change_cursor(body: &JsonValue) -> Result<Option<i64>, UpstreamError> {
    if !body.is_object() {
        return Err(UpstreamError::Shape {
            endpoint: "change_id",
            message: "body is not a JSON object".into(),
        });
    }
    Ok(json_i64(body.get("change_id")).filter(|cursor| *cursor != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changes_page_reads_cursor_metadata() {
        let page = parse_changes_page(&json!({
            "result": [{"inner_id": "a1", "change_type": "changed", "data": {"new_price": 5}}],
            "meta": {"cur_change_id": 100, "next_change_id": "101"}
        }))
        .expect("parse");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].external_id().as_deref(), Some("a1"));
        assert_eq!(page.served_cursor, Some(100));
        assert_eq!(page.next_cursor, Some(101));
    }

    #[test]
    fn null_next_cursor_ends_the_feed() {
        let page = parse_changes_page(&json!({"result": [], "meta": {"next_change_id": null}}))
            .expect("parse");
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn malformed_items_survive_as_idless_records() {
        let page = parse_offers_page(&json!({"result": [42, {"inner_id": 7}], "meta": {"next_page": 2}}))
            .expect("parse");
        assert_eq!(page.items[0].external_id(), None);
        assert_eq!(page.items[1].external_id().as_deref(), Some("7"));
        assert_eq!(page.next_page, Some(2));
    }

    #[test]
    fn zero_or_missing_change_cursor_means_empty_date() {
        assert_eq!(parse_change_cursor(&json!({"change_id": 0})).expect("parse"), None);
        assert_eq!(parse_change_cursor(&json!({})).expect("parse"), None);
        assert_eq!(
            parse_change_cursor(&json!({"change_id": 9001})).expect("parse"),
            Some(9001)
        );
        assert!(parse_change_cursor(&json!([1])).is_err());
    }

    #[test]
    fn odd_field_types_keep_the_record_identity() {
        let page = parse_changes_page(&json!({
            "result": [{
                "inner_id": "a",
                "change_type": "added",
                "created_at": 1709280000,
                "data": {"price": 1}
            }],
            "meta": {"next_change_id": null}
        }))
        .expect("parse");
        let record = &page.items[0];
        assert_eq!(record.external_id().as_deref(), Some("a"));
        assert_eq!(record.created_at_text(), None);
        assert_eq!(record.payload(), json!({"price": 1}));
    }

    #[test]
    fn null_data_becomes_empty_payload() {
        let record: ChangeRecord =
            serde_json::from_value(json!({"inner_id": "x", "data": null})).expect("record");
        assert_eq!(record.payload(), json!({}));
    }
}
