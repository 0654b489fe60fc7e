//! Drains the change feed for one calendar date and advances the watermark.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use lotsync_adapters::ListingApi;
use lotsync_core::{IngestionSource, OperationStatus, SyncWatermark};
use lotsync_storage::Store;
use serde::Serialize;
use tracing::{error, info};

use crate::applier::{ChangeApplier, ChangeStats};
use crate::RunReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum WalkOutcome {
    /// The watermark already covers the date.
    AlreadyDrained,
    /// Upstream returned no cursor for the date. The watermark is left
    /// alone so a cursor published later is still drained.
    EmptyDate,
    Completed,
    /// Aborted part-way; the watermark was not touched.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    pub date: NaiveDate,
    pub pages: usize,
    pub records: usize,
    pub last_cursor: Option<i64>,
    pub stats: ChangeStats,
    pub outcome: WalkOutcome,
}

impl WalkReport {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            pages: 0,
            records: 0,
            last_cursor: None,
            stats: ChangeStats::default(),
            outcome: WalkOutcome::Completed,
        }
    }

    pub fn advanced_watermark(&self) -> bool {
        matches!(self.outcome, WalkOutcome::Completed)
    }
}

impl RunReport for WalkReport {
    fn status(&self) -> OperationStatus {
        if matches!(self.outcome, WalkOutcome::Failed(_)) || self.stats.errors > 0 {
            OperationStatus::Error
        } else {
            OperationStatus::Ok
        }
    }

    fn detail(&self) -> String {
        let s = &self.stats;
        let head = format!(
            "date={} pages={} loaded={} updated={} removed={} duplicates={} errors={}",
            self.date, self.pages, s.loaded, s.updated, s.removed, s.duplicates, s.errors
        );
        match &self.outcome {
            WalkOutcome::AlreadyDrained => format!("{head} (already drained)"),
            WalkOutcome::EmptyDate => format!("{head} (no changes)"),
            WalkOutcome::Completed if s.errors > 0 => {
                format!("{head}; completed with {} errors", s.errors)
            }
            WalkOutcome::Completed => head,
            WalkOutcome::Failed(message) => format!("{head}; failed: {message}"),
        }
    }
}

/// Yesterday in UTC: the most recent date whose feed is complete.
pub fn default_target_date() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

pub struct ChangeWalker<'a> {
    api: &'a dyn ListingApi,
    store: &'a dyn Store,
    page_delay: Duration,
}

impl<'a> ChangeWalker<'a> {
    pub fn new(api: &'a dyn ListingApi, store: &'a dyn Store, page_delay: Duration) -> Self {
        Self {
            api,
            store,
            page_delay,
        }
    }

    /// Walk every change page for `date`.
    ///
    /// Upstream and commit failures end the walk with a `Failed` outcome and
    /// leave the watermark where it was, so the next run repeats the date.
    /// Only storage failures outside a page commit surface as `Err`.
    pub async fn drain(&self, date: NaiveDate) -> Result<WalkReport> {
        let mut report = WalkReport::new(date);

        let watermark = self.store.load_watermark().await.context("loading watermark")?;
        if let Some(mark) = &watermark {
            if mark.last_successful_date >= date {
                info!(%date, watermark = %mark.last_successful_date, "date already drained");
                report.outcome = WalkOutcome::AlreadyDrained;
                return Ok(report);
            }
        }

        let first_cursor = match self.api.change_cursor(date).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => {
                info!(%date, "no change cursor upstream for date; watermark unchanged");
                report.outcome = WalkOutcome::EmptyDate;
                return Ok(report);
            }
            Err(err) => {
                error!(%date, error = %err, "could not resolve initial change cursor");
                report.stats.errors += 1;
                report.outcome = WalkOutcome::Failed(format!("change cursor: {err}"));
                return Ok(report);
            }
        };

        let applier = ChangeApplier::new(self.store, IngestionSource::Incremental);
        let mut cursor = first_cursor;
        loop {
            if report.pages > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            let page = match self.api.changes(cursor).await {
                Ok(page) => page,
                Err(err) => {
                    error!(%date, cursor, error = %err, "change page fetch failed");
                    report.stats.errors += 1;
                    report.outcome = WalkOutcome::Failed(format!("cursor {cursor}: {err}"));
                    return Ok(report);
                }
            };
            report.pages += 1;
            report.records += page.items.len();

            if !page.items.is_empty() {
                match applier.apply_page(&page.items, Utc::now()).await {
                    Ok(stats) => report.stats += stats,
                    Err(failure) => {
                        error!(%date, cursor, error = %failure, "change page commit failed");
                        report.stats += failure.stats;
                        report.outcome = WalkOutcome::Failed(format!("cursor {cursor}: {failure}"));
                        return Ok(report);
                    }
                }
            }
            report.last_cursor = Some(page.served_cursor.unwrap_or(cursor));

            info!(
                %date,
                cursor,
                page = report.pages,
                records = report.records,
                loaded = report.stats.loaded,
                updated = report.stats.updated,
                removed = report.stats.removed,
                "change page applied"
            );

            match page.next_cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }

        self.advance(date, report.last_cursor).await?;
        Ok(report)
    }

    async fn advance(&self, date: NaiveDate, last_cursor: Option<i64>) -> Result<()> {
        let watermark = SyncWatermark {
            last_successful_date: date,
            last_cursor,
            updated_at: Utc::now(),
        };
        self.store
            .save_watermark(&watermark)
            .await
            .with_context(|| format!("saving watermark for {date}"))?;
        info!(%date, ?last_cursor, "watermark advanced");
        Ok(())
    }
}
