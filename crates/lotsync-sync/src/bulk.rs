//! Initial load: page through the full listing and seed the raw store.

use std::time::Duration;

use chrono::Utc;
use lotsync_adapters::ListingApi;
use lotsync_core::{IngestionSource, OperationStatus};
use lotsync_storage::Store;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::applier::ChangeApplier;
use crate::RunReport;

/// Page errors tolerated before the load gives up.
pub const MAX_PAGE_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadReport {
    pub pages: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub errors: usize,
    pub aborted: bool,
}

impl RunReport for BulkLoadReport {
    fn status(&self) -> OperationStatus {
        if self.errors > 0 {
            OperationStatus::Error
        } else {
            OperationStatus::Ok
        }
    }

    fn detail(&self) -> String {
        let mut detail = format!(
            "pages={} loaded={} skipped={} errors={}",
            self.pages, self.loaded, self.skipped, self.errors
        );
        if self.aborted {
            detail.push_str("; stopped after too many page errors");
        } else if self.errors > 0 {
            detail.push_str(&format!("; completed with {} errors", self.errors));
        }
        detail
    }
}

pub struct BulkLoader<'a> {
    api: &'a dyn ListingApi,
    store: &'a dyn Store,
    page_delay: Duration,
    max_pages: Option<u32>,
}

impl<'a> BulkLoader<'a> {
    pub fn new(api: &'a dyn ListingApi, store: &'a dyn Store, page_delay: Duration) -> Self {
        Self {
            api,
            store,
            page_delay,
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages.filter(|n| *n > 0);
        self
    }

    pub async fn load(&self) -> BulkLoadReport {
        let applier = ChangeApplier::new(self.store, IngestionSource::Bulk);
        let mut report = BulkLoadReport::default();
        let mut page = 1u32;
        let mut fetched = 0u32;
        info!(max_pages = ?self.max_pages, "starting bulk load");

        loop {
            if let Some(max) = self.max_pages {
                if page > max {
                    info!(max, "max pages reached");
                    break;
                }
            }
            if fetched > 0 {
                self.pause().await;
            }
            fetched += 1;

            let result = match self.api.list_offers(page).await {
                Ok(listing) if listing.items.is_empty() => {
                    info!(page, "empty listing page; bulk load finished");
                    break;
                }
                Ok(listing) => applier
                    .apply_listing_page(&listing.items, Utc::now())
                    .await
                    .map(|stats| (stats, listing.next_page))
                    .map_err(anyhow::Error::from),
                Err(err) => Err(anyhow::Error::from(err)),
            };

            match result {
                Ok((stats, next_page)) => {
                    report.pages += 1;
                    report.loaded += stats.loaded;
                    report.skipped += stats.duplicates + stats.errors;
                    info!(
                        page,
                        loaded = report.loaded,
                        skipped = report.skipped,
                        errors = report.errors,
                        "listing page stored"
                    );
                    match next_page {
                        Some(next) if next > page => page = next,
                        Some(next) => {
                            warn!(page, next, "listing pointed backwards; stopping");
                            break;
                        }
                        None => break,
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    let message = format!("{err:#}");
                    error!(page, error = %message, "listing page failed");
                    if report.errors > MAX_PAGE_ERRORS {
                        error!(errors = report.errors, "too many page errors; stopping bulk load");
                        report.aborted = true;
                        break;
                    }
                    page += 1;
                }
            }
        }

        info!(
            pages = report.pages,
            loaded = report.loaded,
            skipped = report.skipped,
            errors = report.errors,
            "bulk load finished"
        );
        report
    }

    async fn pause(&self) {
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
    }
}
