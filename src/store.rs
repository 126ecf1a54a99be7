//! Thread storage using SQLite

use crate::error::{MemoryError, Result};
use crate::storage_traits::{MessageStore, ObservationStore, ThreadStore};
use crate::types::{Message, Observation, Priority, Role, Sequence};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed message and observation store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Open (or create) `obsmem.db` inside `data_dir` and run migrations
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join("obsmem.db"))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("Opened SQLite store in {}", data_dir.display());

        Ok(Self::new(pool))
    }

    /// Create an in-memory store for testing
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true);

        // A second connection would see a different in-memory database
        let pool = sqlx::pool::PoolOptions::<Sqlite>::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_observations(
        tx: &mut Transaction<'_, Sqlite>,
        thread_id: &str,
        entries: &[Observation],
        first_position: i64,
    ) -> Result<()> {
        for (offset, obs) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO observations (
                    id, thread_id, position, text, priority, created_at,
                    covers_through, referenced_date, relative_date
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&obs.id)
            .bind(thread_id)
            .bind(first_position + offset as i64)
            .bind(&obs.text)
            .bind(obs.priority.as_str())
            .bind(obs.created_at)
            .bind(obs.covers_through as i64)
            .bind(obs.referenced_date)
            .bind(obs.relative_date.as_deref())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn raise_marker(
        tx: &mut Transaction<'_, Sqlite>,
        thread_id: &str,
        entries: &[Observation],
    ) -> Result<()> {
        let Some(max) = entries.iter().map(|o| o.covers_through).max() else {
            return Ok(());
        };
        sqlx::query(
            r#"
            INSERT INTO thread_state (thread_id, compressed_through)
            VALUES (?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                compressed_through = MAX(compressed_through, excluded.compressed_through)
            "#,
        )
        .bind(thread_id)
        .bind(max as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let metadata_json = metadata.as_ref().map(serde_json::to_string).transpose()?;
        let timestamp = Utc::now();

        let mut tx = self.pool.begin().await?;
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO thread_state (thread_id, next_sequence)
            VALUES (?, 1)
            ON CONFLICT(thread_id) DO UPDATE SET next_sequence = next_sequence + 1
            RETURNING next_sequence
            "#,
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (thread_id, sequence, role, content, timestamp, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(thread_id)
        .bind(sequence)
        .bind(role.as_str())
        .bind(content)
        .bind(timestamp)
        .bind(metadata_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Message {
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            sequence: sequence as Sequence,
            timestamp,
            metadata,
        })
    }

    async fn read_range(
        &self,
        thread_id: &str,
        from_exclusive: Sequence,
        to_inclusive: Option<Sequence>,
    ) -> Result<Vec<Message>> {
        let upper = to_inclusive.map(|s| s as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT thread_id, sequence, role, content, timestamp, metadata
            FROM messages
            WHERE thread_id = ? AND sequence > ? AND sequence <= ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(thread_id)
        .bind(from_exclusive as i64)
        .bind(upper)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn latest_sequence(&self, thread_id: &str) -> Result<Sequence> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT next_sequence FROM thread_state WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(latest.unwrap_or(0) as Sequence)
    }

    async fn delete_through(&self, thread_id: &str, through: Sequence) -> Result<usize> {
        let result = sqlx::query("DELETE FROM messages WHERE thread_id = ? AND sequence <= ?")
            .bind(thread_id)
            .bind(through as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, thread_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ObservationStore for SqliteStore {
    async fn read_all(&self, thread_id: &str) -> Result<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, thread_id, text, priority, created_at, covers_through,
                   referenced_date, relative_date
            FROM observations
            WHERE thread_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_observation).collect()
    }

    async fn append(&self, thread_id: &str, entries: &[Observation]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let last_position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), 0) FROM observations WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_observations(&mut tx, thread_id, entries, last_position + 1).await?;
        Self::raise_marker(&mut tx, thread_id, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_all(&self, thread_id: &str, entries: &[Observation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM observations WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;

        Self::insert_observations(&mut tx, thread_id, entries, 1).await?;
        Self::raise_marker(&mut tx, thread_id, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn compressed_through(&self, thread_id: &str) -> Result<Sequence> {
        let marker: Option<i64> =
            sqlx::query_scalar("SELECT compressed_through FROM thread_state WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(marker.unwrap_or(0) as Sequence)
    }
}

#[async_trait]
impl ThreadStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn clear_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "observations", "thread_state"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE thread_id = ?"))
                .bind(thread_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Helper: Convert database row to Message
fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let role_str: String = row.try_get("role")?;
    let role = role_str
        .parse::<Role>()
        .map_err(MemoryError::Storage)?;

    let metadata_json: Option<String> = row.try_get("metadata")?;
    let metadata = metadata_json
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Message {
        thread_id: row.try_get("thread_id")?,
        role,
        content: row.try_get("content")?,
        sequence: row.try_get::<i64, _>("sequence")? as Sequence,
        timestamp: row.try_get("timestamp")?,
        metadata,
    })
}

/// Helper: Convert database row to Observation
fn row_to_observation(row: &SqliteRow) -> Result<Observation> {
    let priority: String = row.try_get("priority")?;

    Ok(Observation {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        text: row.try_get("text")?,
        priority: Priority::parse(&priority),
        created_at: row.try_get("created_at")?,
        covers_through: row.try_get::<i64, _>("covers_through")? as Sequence,
        referenced_date: row.try_get("referenced_date")?,
        relative_date: row.try_get("relative_date")?,
    })
}
