//! Sync engine orchestration: bulk load, change-feed walk and normalization,
//! each run under a named lock and recorded in the operation ledger.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use lotsync_adapters::{load_fixture_script, HttpListingApi, ListingApi, ScriptedListingApi};
use lotsync_core::{
    DictionaryTranslator, IdentityTranslator, OperationRecord, SyncWatermark, Translator,
};
use lotsync_storage::{PgStore, RunLock, Store, StoreStats};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod applier;
pub mod bulk;
pub mod config;
pub mod ledger;
pub mod normalize;
pub mod walker;

pub use applier::{parse_source_timestamp, ChangeApplier, ChangeStats, PageFailure, RecordError};
pub use bulk::{BulkLoadReport, BulkLoader};
pub use config::{ConfigFile, SyncConfig};
pub use lotsync_core::{OperationKind, OperationStatus};
pub use ledger::{OperationLedger, OpenOperation};
pub use normalize::{normalize_record, ExtractError, NormalizeStats, Normalizer, RecordOutcome};
pub use walker::{default_target_date, ChangeWalker, WalkOutcome, WalkReport};

pub const CRATE_NAME: &str = "lotsync-sync";

/// Lock guarding bulk loads and change-feed walks.
pub const INGEST_LOCK: &str = "ingest";
/// Lock guarding normalization passes.
pub const NORMALIZE_LOCK: &str = "normalize";

/// Outcome of a top-level run as seen by the operation ledger.
pub trait RunReport {
    fn status(&self) -> OperationStatus;
    fn detail(&self) -> String;
}

/// Run `work` under the `lock_name` lock, racing it against Ctrl-C, and
/// record the result in the ledger.
///
/// An interrupt drops the in-flight future, so an open page or batch never
/// commits. A held lock fails fast without a ledger entry.
pub async fn supervise<R, F>(
    store: &dyn Store,
    lock_dir: &Path,
    lock_name: &str,
    kind: OperationKind,
    work: F,
) -> Result<R>
where
    R: RunReport,
    F: Future<Output = Result<R>>,
{
    let _lock = RunLock::acquire(lock_dir, lock_name)?;
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id, %kind);

    let ledger = OperationLedger::new(store);
    let operation = ledger.open(kind);

    let outcome = tokio::select! {
        result = work.instrument(span.clone()) => result,
        _ = interrupted() => Err(anyhow!("interrupted")),
    };

    async {
        match outcome {
            Ok(report) => {
                let status = report.status();
                ledger.close(operation, status, Some(report.detail())).await;
                if status == OperationStatus::Error {
                    warn!(detail = %report.detail(), "run finished with errors");
                }
                Ok(report)
            }
            Err(err) => {
                let detail = format!("{err:#}");
                error!(error = %detail, "run failed");
                ledger.close(operation, OperationStatus::Error, Some(detail)).await;
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    warn!("interrupt received");
}

pub async fn run_bulk_load(
    store: &dyn Store,
    api: &dyn ListingApi,
    config: &SyncConfig,
    max_pages: Option<u32>,
) -> Result<BulkLoadReport> {
    supervise(store, &config.lock_dir, INGEST_LOCK, OperationKind::DataFetch, async {
        Ok(BulkLoader::new(api, store, config.bulk_page_delay)
            .with_max_pages(max_pages)
            .load()
            .await)
    })
    .await
}

pub async fn run_daily_update(
    store: &dyn Store,
    api: &dyn ListingApi,
    config: &SyncConfig,
    date: Option<NaiveDate>,
) -> Result<WalkReport> {
    let date = date.unwrap_or_else(default_target_date);
    supervise(store, &config.lock_dir, INGEST_LOCK, OperationKind::DataFetch, async {
        info!(%date, "daily update starting");
        ChangeWalker::new(api, store, config.change_page_delay)
            .drain(date)
            .await
    })
    .await
}

pub async fn run_normalization(
    store: &dyn Store,
    translator: &dyn Translator,
    config: &SyncConfig,
    limit: Option<usize>,
) -> Result<NormalizeStats> {
    supervise(
        store,
        &config.lock_dir,
        NORMALIZE_LOCK,
        OperationKind::Normalization,
        async {
            Normalizer::new(store, translator, config.normalization_batch_size)
                .run(limit)
                .await
        },
    )
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub watermark: Option<SyncWatermark>,
    pub raw_total: u64,
    pub raw_unprocessed: u64,
    pub raw_inactive: u64,
    pub processed_total: u64,
    pub recent_operations: Vec<OperationRecord>,
}

pub async fn status_report(store: &dyn Store, recent: usize) -> Result<StatusReport> {
    let StoreStats {
        raw_total,
        raw_unprocessed,
        raw_inactive,
        processed_total,
    } = store.stats().await.context("reading table counts")?;
    Ok(StatusReport {
        watermark: store.load_watermark().await.context("loading watermark")?,
        raw_total,
        raw_unprocessed,
        raw_inactive,
        processed_total,
        recent_operations: store
            .recent_operations(recent)
            .await
            .context("reading operation ledger")?,
    })
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to postgres")
}

/// The HTTP client, or a replay of `fixture` when one is given.
pub fn build_api(config: &SyncConfig, fixture: Option<&Path>) -> Result<Arc<dyn ListingApi>> {
    match fixture {
        Some(path) => {
            info!(fixture = %path.display(), "replaying upstream from fixture");
            Ok(Arc::new(ScriptedListingApi::new(load_fixture_script(path)?)))
        }
        None => Ok(Arc::new(HttpListingApi::new(config.api_config(), Uuid::new_v4())?)),
    }
}

pub fn load_translator(config: &SyncConfig) -> Result<Arc<dyn Translator>> {
    match &config.translations_path {
        Some(path) => {
            let dictionary = DictionaryTranslator::from_json_file(path)?;
            info!(entries = dictionary.len(), path = %path.display(), "translation dictionary loaded");
            Ok(Arc::new(dictionary))
        }
        None => Ok(Arc::new(IdentityTranslator)),
    }
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    store.migrate().await.context("running migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn run_bulk_load_from_env(
    max_pages: Option<u32>,
    fixture: Option<&Path>,
) -> Result<BulkLoadReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let api = build_api(&config, fixture)?;
    run_bulk_load(&store, api.as_ref(), &config, max_pages).await
}

pub async fn run_daily_update_from_env(
    date: Option<NaiveDate>,
    fixture: Option<&Path>,
) -> Result<WalkReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let api = build_api(&config, fixture)?;
    run_daily_update(&store, api.as_ref(), &config, date).await
}

pub async fn run_normalization_from_env(
    limit: Option<usize>,
    batch_size: Option<usize>,
) -> Result<NormalizeStats> {
    let mut config = SyncConfig::from_env()?;
    if let Some(size) = batch_size.filter(|size| *size > 0) {
        config.normalization_batch_size = size;
    }
    let store = connect_store(&config).await?;
    let translator = load_translator(&config)?;
    run_normalization(&store, translator.as_ref(), &config, limit).await
}

pub async fn status_from_env(recent: usize) -> Result<StatusReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    status_report(&store, recent).await
}

pub async fn fetch_offer_from_env(external_id: &str, fixture: Option<&Path>) -> Result<JsonValue> {
    let config = SyncConfig::from_env()?;
    let api = build_api(&config, fixture)?;
    api.offer(external_id)
        .await
        .with_context(|| format!("fetching offer {external_id}"))
}

/// Daily update for yesterday followed by a normalization pass.
pub async fn run_scheduled_cycle(config: &SyncConfig) -> Result<()> {
    let store = connect_store(config).await?;
    let api = build_api(config, None)?;
    let translator = load_translator(config)?;

    let walk = run_daily_update(&store, api.as_ref(), config, None).await?;
    if let WalkOutcome::Failed(reason) = &walk.outcome {
        warn!(date = %walk.date, %reason, "change feed not fully drained; normalizing what arrived");
    }
    run_normalization(&store, translator.as_ref(), config, None).await?;
    Ok(())
}

pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let shared = Arc::new(config.clone());
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&shared);
        Box::pin(async move {
            info!("scheduled sync triggered");
            if let Err(err) = run_scheduled_cycle(&config).await {
                let message = format!("{err:#}");
                error!(error = %message, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Run the scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let mut config = SyncConfig::from_env()?;
    config.scheduler_enabled = true;
    let Some(mut sched) = maybe_build_scheduler(&config).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running");
    interrupted().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
