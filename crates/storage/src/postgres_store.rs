//! Run store implementation using `PostgreSQL`
//!
//! Runs are kept as JSONB records next to their `state` and `version`
//! columns. The version column is the compare-and-swap token and a partial
//! unique index enforces one active run per video.

use crate::{RunStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::{error::SqlState, Client, NoTls, Row};
use video_search_common::{PipelineRun, RunState, VideoAsset};

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB")
                .unwrap_or_else(|_| "video_search".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// `PostgreSQL` run store implementation
pub struct PostgresRunStore {
    client: Client,
}

fn pg_err(e: tokio_postgres::Error) -> StorageError {
    StorageError::PostgresError(e.to_string())
}

fn run_from_row(row: &Row) -> StorageResult<PipelineRun> {
    let record: serde_json::Value = row.get("record");
    Ok(serde_json::from_value(record)?)
}

fn asset_from_row(row: &Row) -> VideoAsset {
    let status: String = row.get("status");
    let size: i64 = row.get("size_bytes");
    VideoAsset {
        id: row.get("video_id"),
        source_reference: row.get("source_reference"),
        size: size.max(0) as u64,
        uploaded_at: row.get::<_, DateTime<Utc>>("uploaded_at"),
        status: RunState::parse(&status).unwrap_or(RunState::Created),
        latest_run_id: row.get("latest_run_id"),
    }
}

impl PostgresRunStore {
    /// Create a new `PostgreSQL` run store client
    pub async fn new(config: PostgresConfig) -> StorageResult<Self> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(pg_err)?;

        // Spawn connection in background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self { client })
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .batch_execute(
                r"
                CREATE TABLE IF NOT EXISTS video_assets (
                    video_id TEXT PRIMARY KEY,
                    source_reference TEXT NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    uploaded_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    status TEXT NOT NULL,
                    latest_run_id TEXT
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    run_id TEXT PRIMARY KEY,
                    video_id TEXT NOT NULL REFERENCES video_assets (video_id),
                    state TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    record JSONB NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS pipeline_runs_one_active
                    ON pipeline_runs (video_id)
                    WHERE state NOT IN ('completed', 'failed');

                CREATE INDEX IF NOT EXISTS pipeline_runs_video_created
                    ON pipeline_runs (video_id, created_at DESC);
                ",
            )
            .await
            .map_err(pg_err)?;

        tracing::info!("Initialized PostgreSQL run store schema");
        Ok(())
    }

    async fn current_version(&self, run_id: &str) -> StorageResult<Option<u64>> {
        let row = self
            .client
            .query_opt(
                "SELECT version FROM pipeline_runs WHERE run_id = $1",
                &[&run_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.map(|r| r.get::<_, i64>(0) as u64))
    }
}

#[async_trait::async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self, asset: VideoAsset, run: PipelineRun) -> StorageResult<PipelineRun> {
        self.client
            .execute(
                r"
                INSERT INTO video_assets
                    (video_id, source_reference, size_bytes, uploaded_at, status, latest_run_id)
                VALUES ($1, $2, $3, $4, $5, NULL)
                ON CONFLICT (video_id) DO UPDATE SET
                    source_reference = EXCLUDED.source_reference,
                    size_bytes = EXCLUDED.size_bytes,
                    uploaded_at = EXCLUDED.uploaded_at
                ",
                &[
                    &asset.id,
                    &asset.source_reference,
                    &(asset.size as i64),
                    &asset.uploaded_at,
                    &asset.status.name(),
                ],
            )
            .await
            .map_err(pg_err)?;

        let record = serde_json::to_value(&run)?;
        let inserted = self
            .client
            .execute(
                r"
                INSERT INTO pipeline_runs
                    (run_id, video_id, state, version, record, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
                &[
                    &run.id,
                    &run.video_id,
                    &run.state.name(),
                    &(run.version as i64),
                    &record,
                    &run.created_at,
                    &run.updated_at,
                ],
            )
            .await;

        if let Err(e) = inserted {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                return Err(StorageError::ActiveRunExists(asset.id));
            }
            return Err(pg_err(e));
        }

        self.client
            .execute(
                "UPDATE video_assets SET status = $1, latest_run_id = $2 WHERE video_id = $3",
                &[&run.state.name(), &run.id, &run.video_id],
            )
            .await
            .map_err(pg_err)?;

        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<PipelineRun> {
        let row = self
            .client
            .query_opt(
                "SELECT record FROM pipeline_runs WHERE run_id = $1",
                &[&run_id],
            )
            .await
            .map_err(pg_err)?
            .ok_or_else(|| StorageError::NotFound(run_id.to_string()))?;
        run_from_row(&row)
    }

    async fn latest_run_for_video(&self, video_id: &str) -> StorageResult<Option<PipelineRun>> {
        let row = self
            .client
            .query_opt(
                r"
                SELECT record FROM pipeline_runs
                WHERE video_id = $1
                ORDER BY created_at DESC
                LIMIT 1
                ",
                &[&video_id],
            )
            .await
            .map_err(pg_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn compare_and_swap(&self, mut run: PipelineRun) -> StorageResult<PipelineRun> {
        let expected = run.version;
        run.version += 1;
        let record = serde_json::to_value(&run)?;

        let updated = self
            .client
            .execute(
                r"
                UPDATE pipeline_runs
                SET state = $1, version = $2, record = $3, updated_at = $4
                WHERE run_id = $5 AND version = $6
                ",
                &[
                    &run.state.name(),
                    &(run.version as i64),
                    &record,
                    &run.updated_at,
                    &run.id,
                    &(expected as i64),
                ],
            )
            .await
            .map_err(pg_err)?;

        if updated == 0 {
            return match self.current_version(&run.id).await? {
                Some(actual) => Err(StorageError::VersionConflict {
                    run_id: run.id,
                    expected,
                    actual,
                }),
                None => Err(StorageError::NotFound(run.id)),
            };
        }

        self.client
            .execute(
                "UPDATE video_assets SET status = $1 WHERE video_id = $2 AND latest_run_id = $3",
                &[&run.state.name(), &run.video_id, &run.id],
            )
            .await
            .map_err(pg_err)?;

        Ok(run)
    }

    async fn get_asset(&self, video_id: &str) -> StorageResult<VideoAsset> {
        let row = self
            .client
            .query_opt(
                r"
                SELECT video_id, source_reference, size_bytes, uploaded_at, status, latest_run_id
                FROM video_assets WHERE video_id = $1
                ",
                &[&video_id],
            )
            .await
            .map_err(pg_err)?
            .ok_or_else(|| StorageError::NotFound(video_id.to_string()))?;
        Ok(asset_from_row(&row))
    }

    async fn list_assets(&self) -> StorageResult<Vec<VideoAsset>> {
        let rows = self
            .client
            .query(
                r"
                SELECT video_id, source_reference, size_bytes, uploaded_at, status, latest_run_id
                FROM video_assets ORDER BY video_id
                ",
                &[],
            )
            .await
            .map_err(pg_err)?;
        Ok(rows.iter().map(asset_from_row).collect())
    }

    async fn active_runs(&self) -> StorageResult<Vec<PipelineRun>> {
        let rows = self
            .client
            .query(
                r"
                SELECT record FROM pipeline_runs
                WHERE state NOT IN ('completed', 'failed')
                ORDER BY run_id
                ",
                &[],
            )
            .await
            .map_err(pg_err)?;
        rows.iter().map(run_from_row).collect()
    }
}
