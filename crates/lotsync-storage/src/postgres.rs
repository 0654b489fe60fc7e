//! PostgreSQL-backed `Store`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lotsync_core::{
    ConfigParam, ListingFields, OperationRecord, ProcessedRecord, RawRecord, SyncWatermark,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{NormalizedCommit, RawWrite, StagedProjection, Store, StoreError, StoreStats};

const RAW_COLUMNS: &str = "seq, external_id, change_kind, source_created_at, payload, \
     ingested_at, last_touched_at, ingestion_source, active, processed";

const PROCESSED_COLUMNS: &str = "external_id, active, source_created_at, url, mark, model, \
     year, color, price, km_age, engine_type, transmission_type, body_type, address, section, \
     offer_created, description, displacement, vin, first_registration, power, drive_type, \
     images, options, configuration, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database schema is up to date");
        Ok(())
    }

    async fn insert_raw(
        tx: &mut Transaction<'_, Postgres>,
        record: &RawRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO raw_records (external_id, change_kind, source_created_at, payload, \
             ingested_at, last_touched_at, ingestion_source, active, processed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&record.external_id)
        .bind(record.change_kind.as_str())
        .bind(record.source_created_at)
        .bind(&record.payload)
        .bind(record.ingested_at)
        .bind(record.last_touched_at)
        .bind(record.ingestion_source.as_str())
        .bind(record.active)
        .bind(record.processed)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_raw(
        tx: &mut Transaction<'_, Postgres>,
        record: &RawRecord,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE raw_records SET change_kind = $2, source_created_at = $3, payload = $4, \
             last_touched_at = $5, active = $6, processed = $7 WHERE external_id = $1",
        )
        .bind(&record.external_id)
        .bind(record.change_kind.as_str())
        .bind(record.source_created_at)
        .bind(&record.payload)
        .bind(record.last_touched_at)
        .bind(record.active)
        .bind(record.processed)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRaw(record.external_id.clone()));
        }
        Ok(())
    }

    /// Returns `true` when the row was created rather than overwritten.
    async fn upsert_processed(
        tx: &mut Transaction<'_, Postgres>,
        record: &ProcessedRecord,
    ) -> Result<bool, StoreError> {
        let f = &record.fields;
        let sql = format!(
            "INSERT INTO processed_records ({PROCESSED_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
             $19, $20, $21, $22, $23, $24, $25, $26) \
             ON CONFLICT (external_id) DO UPDATE SET \
             active = EXCLUDED.active, source_created_at = EXCLUDED.source_created_at, \
             url = EXCLUDED.url, mark = EXCLUDED.mark, model = EXCLUDED.model, \
             year = EXCLUDED.year, color = EXCLUDED.color, price = EXCLUDED.price, \
             km_age = EXCLUDED.km_age, engine_type = EXCLUDED.engine_type, \
             transmission_type = EXCLUDED.transmission_type, body_type = EXCLUDED.body_type, \
             address = EXCLUDED.address, section = EXCLUDED.section, \
             offer_created = EXCLUDED.offer_created, description = EXCLUDED.description, \
             displacement = EXCLUDED.displacement, vin = EXCLUDED.vin, \
             first_registration = EXCLUDED.first_registration, power = EXCLUDED.power, \
             drive_type = EXCLUDED.drive_type, images = EXCLUDED.images, \
             options = EXCLUDED.options, configuration = EXCLUDED.configuration, \
             updated_at = EXCLUDED.updated_at \
             RETURNING (xmax = 0) AS inserted"
        );
        let row = sqlx::query(&sql)
            .bind(&record.external_id)
            .bind(record.active)
            .bind(record.source_created_at)
            .bind(&f.url)
            .bind(&f.mark)
            .bind(&f.model)
            .bind(f.year)
            .bind(&f.color)
            .bind(f.price)
            .bind(f.km_age)
            .bind(&f.engine_type)
            .bind(&f.transmission_type)
            .bind(&f.body_type)
            .bind(&f.address)
            .bind(&f.section)
            .bind(f.offer_created)
            .bind(&f.description)
            .bind(f.displacement)
            .bind(&f.vin)
            .bind(f.first_registration)
            .bind(f.power)
            .bind(&f.drive_type)
            .bind(Json(&f.images))
            .bind(Json(&f.options))
            .bind(f.configuration.as_ref().map(Json))
            .bind(record.updated_at)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.try_get("inserted")?)
    }
}

fn corrupt(table: &'static str, message: impl ToString) -> StoreError {
    StoreError::Corrupt {
        table,
        message: message.to_string(),
    }
}

fn raw_from_row(row: &PgRow) -> Result<RawRecord, StoreError> {
    let change_kind: String = row.try_get("change_kind")?;
    let ingestion_source: String = row.try_get("ingestion_source")?;
    Ok(RawRecord {
        seq: row.try_get("seq")?,
        external_id: row.try_get("external_id")?,
        change_kind: change_kind.parse().map_err(|e| corrupt("raw_records", e))?,
        source_created_at: row.try_get("source_created_at")?,
        payload: row.try_get("payload")?,
        ingested_at: row.try_get("ingested_at")?,
        last_touched_at: row.try_get("last_touched_at")?,
        ingestion_source: ingestion_source
            .parse()
            .map_err(|e| corrupt("raw_records", e))?,
        active: row.try_get("active")?,
        processed: row.try_get("processed")?,
    })
}

fn processed_from_row(row: &PgRow) -> Result<ProcessedRecord, StoreError> {
    let images: Json<Vec<String>> = row.try_get("images")?;
    let options: Json<Vec<String>> = row.try_get("options")?;
    let configuration: Option<Json<BTreeMap<String, ConfigParam>>> =
        row.try_get("configuration")?;
    Ok(ProcessedRecord {
        external_id: row.try_get("external_id")?,
        active: row.try_get("active")?,
        source_created_at: row.try_get("source_created_at")?,
        fields: ListingFields {
            url: row.try_get("url")?,
            mark: row.try_get("mark")?,
            model: row.try_get("model")?,
            year: row.try_get("year")?,
            color: row.try_get("color")?,
            price: row.try_get("price")?,
            km_age: row.try_get("km_age")?,
            engine_type: row.try_get("engine_type")?,
            transmission_type: row.try_get("transmission_type")?,
            body_type: row.try_get("body_type")?,
            address: row.try_get("address")?,
            section: row.try_get("section")?,
            offer_created: row.try_get::<Option<NaiveDate>, _>("offer_created")?,
            description: row.try_get("description")?,
            displacement: row.try_get("displacement")?,
            vin: row.try_get("vin")?,
            first_registration: row.try_get::<Option<NaiveDate>, _>("first_registration")?,
            power: row.try_get("power")?,
            drive_type: row.try_get("drive_type")?,
            images: images.0,
            options: options.0,
            configuration: configuration.map(|c| c.0),
        },
        updated_at: row.try_get("updated_at")?,
    })
}

fn operation_from_row(row: &PgRow) -> Result<OperationRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(OperationRecord {
        kind: kind.parse().map_err(|e| corrupt("operations_log", e))?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        duration_ms: row.try_get("duration_ms")?,
        status: status.parse().map_err(|e| corrupt("operations_log", e))?,
        detail: row.try_get("detail")?,
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[async_trait]
impl Store for PgStore {
    async fn find_raw(&self, external_ids: &[String]) -> Result<Vec<RawRecord>, StoreError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {RAW_COLUMNS} FROM raw_records WHERE external_id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(external_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(raw_from_row).collect()
    }

    async fn get_raw(&self, external_id: &str) -> Result<Option<RawRecord>, StoreError> {
        let sql = format!("SELECT {RAW_COLUMNS} FROM raw_records WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(raw_from_row).transpose()
    }

    async fn commit_raw_page(&self, writes: Vec<RawWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for write in &writes {
            match write {
                RawWrite::Insert(record) => Self::insert_raw(&mut tx, record).await?,
                RawWrite::Update(record) => Self::update_raw(&mut tx, record).await?,
            }
        }
        tx.commit().await?;
        debug!(writes = writes.len(), "raw page committed");
        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_records WHERE NOT processed AND seq > $1 \
             ORDER BY seq LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after_seq)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(raw_from_row).collect()
    }

    async fn count_unprocessed(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_records WHERE NOT processed")
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn commit_normalized_batch(
        &self,
        staged: Vec<StagedProjection>,
    ) -> Result<NormalizedCommit, StoreError> {
        let mut commit = NormalizedCommit::default();
        if staged.is_empty() {
            return Ok(commit);
        }
        let mut tx = self.pool.begin().await?;
        for projection in &staged {
            let marked = sqlx::query(
                "UPDATE raw_records SET processed = TRUE WHERE seq = $1 AND last_touched_at = $2",
            )
            .bind(projection.raw_seq)
            .bind(projection.raw_touched_at)
            .execute(&mut *tx)
            .await?;
            if marked.rows_affected() == 0 {
                commit.stale += 1;
                continue;
            }
            if Self::upsert_processed(&mut tx, &projection.record).await? {
                commit.created += 1;
            } else {
                commit.updated += 1;
            }
        }
        tx.commit().await?;
        Ok(commit)
    }

    async fn get_processed(
        &self,
        external_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        let sql =
            format!("SELECT {PROCESSED_COLUMNS} FROM processed_records WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(processed_from_row).transpose()
    }

    async fn load_watermark(&self) -> Result<Option<SyncWatermark>, StoreError> {
        let row = sqlx::query(
            "SELECT last_successful_date, last_cursor, updated_at FROM sync_watermark WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<SyncWatermark, StoreError> {
            Ok(SyncWatermark {
                last_successful_date: row.try_get("last_successful_date")?,
                last_cursor: row.try_get("last_cursor")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save_watermark(&self, watermark: &SyncWatermark) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_watermark (id, last_successful_date, last_cursor, updated_at) \
             VALUES (1, $1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET last_successful_date = EXCLUDED.last_successful_date, \
             last_cursor = EXCLUDED.last_cursor, updated_at = EXCLUDED.updated_at",
        )
        .bind(watermark.last_successful_date)
        .bind(watermark.last_cursor)
        .bind(watermark.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_operation(&self, record: &OperationRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO operations_log (kind, started_at, duration_ms, status, detail) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.kind.as_str())
        .bind(record.started_at)
        .bind(record.duration_ms)
        .bind(record.status.as_str())
        .bind(&record.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, started_at, duration_ms, status, detail FROM operations_log \
             ORDER BY started_at DESC, id DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT \
               (SELECT COUNT(*) FROM raw_records) AS raw_total, \
               (SELECT COUNT(*) FROM raw_records WHERE NOT processed) AS raw_unprocessed, \
               (SELECT COUNT(*) FROM raw_records WHERE NOT active) AS raw_inactive, \
               (SELECT COUNT(*) FROM processed_records) AS processed_total",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            raw_total: count(row.try_get("raw_total")?),
            raw_unprocessed: count(row.try_get("raw_unprocessed")?),
            raw_inactive: count(row.try_get("raw_inactive")?),
            processed_total: count(row.try_get("processed_total")?),
        })
    }
}
