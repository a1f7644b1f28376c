use crate::config::DatabaseConfig;
use crate::model::{FileRecord, FileStatus, Owner, ProcessingResult};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no owner registered for {0}")]
    OwnerNotFound(String),

    #[error("file record {0} does not exist")]
    RecordNotFound(Uuid),

    #[error("unknown file status id {0}")]
    UnknownStatus(i32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence of owners and file status records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn find_owner_by_email(&self, email: &str) -> Result<Owner, RepositoryError>;

    /// Insert a record in the `Received` state and return its id
    async fn create_file_record(
        &self,
        owner_id: Uuid,
        video_path: &str,
        video_size_bytes: i64,
    ) -> Result<Uuid, RepositoryError>;

    async fn update_file_status(
        &self,
        id: Uuid,
        result: &ProcessingResult,
    ) -> Result<(), RepositoryError>;

    /// Records owned by `email`, newest first
    async fn list_records_by_owner_email(
        &self,
        email: &str,
    ) -> Result<Vec<FileRecord>, RepositoryError>;

    /// Round trip to the backing store
    async fn ping(&self) -> Result<(), RepositoryError>;
}

#[derive(Debug, FromRow)]
struct OwnerRow {
    id: Uuid,
    name: String,
    email: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<OwnerRow> for Owner {
    fn from(row: OwnerRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    user_id: Uuid,
    video_file_path: String,
    video_file_size: i64,
    zip_file_path: Option<String>,
    zip_file_size: Option<i64>,
    status_id: i32,
    processing_result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = RepositoryError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let status =
            FileStatus::from_id(row.status_id).ok_or(RepositoryError::UnknownStatus(row.status_id))?;

        Ok(Self {
            id: row.id,
            owner_id: row.user_id,
            video_path: row.video_file_path,
            video_size_bytes: row.video_file_size,
            archive_path: row.zip_file_path,
            archive_size_bytes: row.zip_file_size,
            status,
            result_message: row.processing_result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed file repository
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl FileRepository for MetadataStore {
    #[instrument(skip(self))]
    async fn find_owner_by_email(&self, email: &str) -> Result<Owner, RepositoryError> {
        let row = sqlx::query_as::<_, OwnerRow>(
            r#"
            SELECT id, name, email, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Owner::from)
            .ok_or_else(|| RepositoryError::OwnerNotFound(email.to_string()))
    }

    #[instrument(skip(self))]
    async fn create_file_record(
        &self,
        owner_id: Uuid,
        video_path: &str,
        video_size_bytes: i64,
    ) -> Result<Uuid, RepositoryError> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO files (user_id, video_file_path, video_file_size, status_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(video_path)
        .bind(video_size_bytes)
        .bind(FileStatus::Received.id())
        .fetch_one(&self.pool)
        .await?;

        debug!(record_id = %id, "File record created");
        Ok(id)
    }

    #[instrument(skip(self, result), fields(status = %result.status))]
    async fn update_file_status(
        &self,
        id: Uuid,
        result: &ProcessingResult,
    ) -> Result<(), RepositoryError> {
        let outcome = sqlx::query(
            r#"
            UPDATE files
            SET status_id = $2,
                zip_file_path = $3,
                zip_file_size = $4,
                processing_result = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result.status.id())
        .bind(&result.archive_path)
        .bind(result.archive_size_bytes)
        .bind(&result.message)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(RepositoryError::RecordNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_records_by_owner_email(
        &self,
        email: &str,
    ) -> Result<Vec<FileRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT f.id, f.user_id, f.video_file_path, f.video_file_size,
                   f.zip_file_path, f.zip_file_size, f.status_id,
                   f.processing_result, f.created_at, f.updated_at
            FROM files f
            JOIN users u ON u.id = f.user_id
            WHERE u.email = $1
            ORDER BY f.created_at DESC
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
