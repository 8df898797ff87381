//! Postgres backed [`ProcessingStore`]
//!
//! One row per fingerprint. The full record lives in a JSONB column; the
//! version and expiry are duplicated into plain columns so the conditional
//! writes can be expressed in SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;

use super::{ProcessingRecord, ProcessingStore};
use crate::error::{IngestError, IngestResult};

#[derive(Clone)]
pub struct PgProcessingStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    record: Json<ProcessingRecord>,
}

fn db_error(err: sqlx::Error) -> IngestError {
    IngestError::Transient(format!("processing store: {err}"))
}

impl PgProcessingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> IngestResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Create the backing table when missing
    pub async fn migrate(&self) -> IngestResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_records (
                fingerprint TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                record JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn version_of(record: &ProcessingRecord) -> i64 {
    i64::try_from(record.version).unwrap_or(i64::MAX)
}

#[async_trait]
impl ProcessingStore for PgProcessingStore {
    #[instrument(skip(self, record), fields(fingerprint = %record.fingerprint))]
    async fn create_if_absent(&self, record: &ProcessingRecord) -> IngestResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_records (fingerprint, version, record, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (fingerprint) DO UPDATE
            SET version = EXCLUDED.version,
                record = EXCLUDED.record,
                expires_at = EXCLUDED.expires_at
            WHERE processing_records.expires_at < NOW()
            "#,
        )
        .bind(&record.fingerprint)
        .bind(version_of(record))
        .bind(Json(record))
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get(&self, fingerprint: &str) -> IngestResult<Option<ProcessingRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT record
            FROM processing_records
            WHERE fingerprint = $1 AND expires_at >= NOW()
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|r| r.record.0))
    }

    #[instrument(skip(self, record), fields(fingerprint = %record.fingerprint))]
    async fn compare_and_swap(
        &self,
        record: &ProcessingRecord,
        expected_version: u64,
    ) -> IngestResult<bool> {
        let expected = i64::try_from(expected_version).unwrap_or(i64::MAX);
        let expires_at: DateTime<Utc> = record.expires_at;
        let result = sqlx::query(
            r#"
            UPDATE processing_records
            SET version = $2, record = $3, expires_at = $4
            WHERE fingerprint = $1 AND version = $5 AND expires_at >= NOW()
            "#,
        )
        .bind(&record.fingerprint)
        .bind(version_of(record))
        .bind(Json(record))
        .bind(expires_at)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}
