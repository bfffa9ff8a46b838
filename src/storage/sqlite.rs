use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{PoolFilter, StimulusItem, Storage, StoredDocument};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const STIMULUS_COLUMNS: &str = r#"
    SELECT s.id, s.pool_id, s.payload, s.labels, s.metadata, s.usage_count,
           (SELECT json_group_array(c.session_id)
              FROM stimulus_claims c
             WHERE c.stimulus_id = s.id) AS claimed_by
      FROM stimuli s
     WHERE s.pool_id = "#;

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create a private in-memory database (tests and dry runs).
    ///
    /// Every SQLite connection to `:memory:` opens a fresh database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Start a stimulus query scoped to the filter's pool and exclusions.
fn stimulus_query(filter: &PoolFilter) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::<Sqlite>::new(STIMULUS_COLUMNS);
    qb.push_bind(filter.pool_id.clone());

    if !filter.exclude.is_empty() {
        qb.push(" AND s.id NOT IN (");
        let mut ids = qb.separated(", ");
        for id in &filter.exclude {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(")");
    }

    qb
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_stimulus(&self, item: &StimulusItem) -> StorageResult<()> {
        let metadata = item
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO stimuli (id, pool_id, payload, labels, metadata, usage_count, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.pool_id)
        .bind(serde_json::to_string(&item.payload)?)
        .bind(serde_json::to_string(&item.labels)?)
        .bind(&metadata)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, filter: &PoolFilter) -> StorageResult<Vec<StimulusItem>> {
        let mut qb = stimulus_query(filter);
        qb.push(" ORDER BY s.seq ASC");

        let rows: Vec<StimulusRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(StimulusItem::try_from).collect()
    }

    async fn least_used(
        &self,
        filter: &PoolFilter,
        limit: usize,
    ) -> StorageResult<Vec<StimulusItem>> {
        let mut qb = stimulus_query(filter);
        qb.push(" ORDER BY s.usage_count ASC, s.seq ASC LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<StimulusRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(StimulusItem::try_from).collect()
    }

    async fn increment_usage(
        &self,
        item_id: &str,
        session_id: &str,
        ceiling: Option<i64>,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = match ceiling {
            Some(ceiling) => {
                sqlx::query(
                    "UPDATE stimuli SET usage_count = usage_count + 1 WHERE id = ? AND usage_count <= ?",
                )
                .bind(item_id)
                .bind(ceiling)
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query("UPDATE stimuli SET usage_count = usage_count + 1 WHERE id = ?")
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?
            }
        };

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(item_id = %item_id, ceiling = ?ceiling, "Claim rejected");
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO stimulus_claims (stimulus_id, session_id, claimed_at) VALUES (?, ?, ?)",
        )
        .bind(item_id)
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_usage(&self, item_id: &str, session_id: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM stimulus_claims WHERE id = (
                SELECT MAX(id) FROM stimulus_claims WHERE stimulus_id = ? AND session_id = ?
            )
            "#,
        )
        .bind(item_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(item_id = %item_id, session_id = %session_id, "No claim to release");
            return Ok(false);
        }

        sqlx::query("UPDATE stimuli SET usage_count = usage_count - 1 WHERE id = ? AND usage_count > 0")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_document(
        &self,
        database: &str,
        collection: &str,
        document: &serde_json::Value,
    ) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO documents (id, database_name, collection_name, body, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(database)
        .bind(collection)
        .bind(serde_json::to_string(document)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn document_exists(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> StorageResult<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE database_name = ",
        );
        qb.push_bind(database.to_string());
        qb.push(" AND collection_name = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND json_extract(body, '$.\"' || ");
        qb.push_bind(field.replace('"', ""));
        qb.push(" || '\"') = ");

        match value {
            serde_json::Value::String(s) => qb.push_bind(s.clone()),
            serde_json::Value::Bool(b) => qb.push_bind(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => qb.push_bind(i),
                None => qb.push_bind(n.as_f64().unwrap_or_default()),
            },
            // Objects and arrays come back from json_extract as JSON text
            other => qb.push_bind(other.to_string()),
        };
        qb.push(")");

        let exists: bool = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(exists)
    }

    async fn get_documents(
        &self,
        database: &str,
        collection: &str,
    ) -> StorageResult<Vec<StoredDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, database_name, collection_name, body, created_at
            FROM documents
            WHERE database_name = ? AND collection_name = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(database)
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredDocument::try_from).collect()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct StimulusRow {
    id: String,
    pool_id: String,
    payload: String,
    labels: String,
    metadata: Option<String>,
    usage_count: i64,
    claimed_by: String,
}

impl TryFrom<StimulusRow> for StimulusItem {
    type Error = StorageError;

    fn try_from(row: StimulusRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            pool_id: row.pool_id,
            payload: serde_json::from_str(&row.payload)?,
            labels: serde_json::from_str(&row.labels)?,
            metadata: row
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            usage_count: row.usage_count,
            claimed_by: serde_json::from_str(&row.claimed_by)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    database_name: String,
    collection_name: String,
    body: String,
    created_at: String,
}

impl TryFrom<DocumentRow> for StoredDocument {
    type Error = StorageError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        use chrono::DateTime;

        Ok(Self {
            id: row.id,
            database: row.database_name,
            collection: row.collection_name,
            body: serde_json::from_str(&row.body)?,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
