//! Fixture-backed `ListingApi`: replays canned upstream responses from a JSON
//! script. Used for offline replays and by the engine's tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use crate::{
    parse_change_cursor, parse_changes_page, parse_offers_page, ChangesPage, ListingApi,
    OffersPage, UpstreamError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedReply {
    Body(JsonValue),
    Fail(String),
}

impl ScriptedReply {
    fn into_body(self) -> Result<JsonValue, UpstreamError> {
        match self {
            Self::Body(body) => Ok(body),
            Self::Fail(message) => Err(UpstreamError::Scripted(message)),
        }
    }
}

/// Raw response bodies keyed by request parameter, in upstream wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureScript {
    #[serde(default)]
    pub offers: BTreeMap<u32, ScriptedReply>,
    #[serde(default)]
    pub change_ids: BTreeMap<NaiveDate, ScriptedReply>,
    #[serde(default)]
    pub changes: BTreeMap<i64, ScriptedReply>,
    #[serde(default)]
    pub offer: BTreeMap<String, ScriptedReply>,
}

pub fn load_fixture_script(path: impl AsRef<Path>) -> Result<FixtureScript> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
pub struct ScriptedListingApi {
    script: FixtureScript,
    calls: Mutex<Vec<String>>,
}

impl ScriptedListingApi {
    pub fn new(script: FixtureScript) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_offers_page(mut self, page: u32, items: JsonValue, next_page: Option<u32>) -> Self {
        self.script.offers.insert(
            page,
            ScriptedReply::Body(json!({"result": items, "meta": {"next_page": next_page}})),
        );
        self
    }

    pub fn with_change_cursor(mut self, date: NaiveDate, cursor: i64) -> Self {
        self.script
            .change_ids
            .insert(date, ScriptedReply::Body(json!({ "change_id": cursor })));
        self
    }

    pub fn with_changes(
        mut self,
        cursor: i64,
        items: JsonValue,
        served_cursor: i64,
        next_cursor: Option<i64>,
    ) -> Self {
        self.script.changes.insert(
            cursor,
            ScriptedReply::Body(json!({
                "result": items,
                "meta": {"cur_change_id": served_cursor, "next_change_id": next_cursor}
            })),
        );
        self
    }

    pub fn failing_offers_page(mut self, page: u32, message: &str) -> Self {
        self.script
            .offers
            .insert(page, ScriptedReply::Fail(message.to_string()));
        self
    }

    pub fn failing_changes(mut self, cursor: i64, message: &str) -> Self {
        self.script
            .changes
            .insert(cursor, ScriptedReply::Fail(message.to_string()));
        self
    }

    /// Every request served so far, as `endpoint:param`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl ListingApi for ScriptedListingApi {
    async fn list_offers(&self, page: u32) -> Result<OffersPage, UpstreamError> {
        self.record(format!("offers:{page}")).await;
        match self.script.offers.get(&page).cloned() {
            Some(reply) => parse_offers_page(&reply.into_body()?),
            None => Ok(OffersPage::default()),
        }
    }

    async fn change_cursor(&self, date: NaiveDate) -> Result<Option<i64>, UpstreamError> {
        self.record(format!("change_id:{date}")).await;
        match self.script.change_ids.get(&date).cloned() {
            Some(reply) => parse_change_cursor(&reply.into_body()?),
            None => Ok(None),
        }
    }

    async fn changes(&self, cursor: i64) -> Result<ChangesPage, UpstreamError> {
        self.record(format!("changes:{cursor}")).await;
        match self.script.changes.get(&cursor).cloned() {
            Some(reply) => parse_changes_page(&reply.into_body()?),
            None => Err(UpstreamError::Scripted(format!(
                "no scripted changes page for cursor {cursor}"
            ))),
        }
    }

    async fn offer(&self, external_id: &str) -> Result<JsonValue, UpstreamError> {
        self.record(format!("offer:{external_id}")).await;
        match self.script.offer.get(external_id).cloned() {
            Some(reply) => reply.into_body(),
            None => Err(UpstreamError::Scripted(format!(
                "no scripted offer {external_id}"
            ))),
        }
    }
}
