//! SQLite-backed queue store.
//!
//! Records live in `queue_records`, keyed by the coalescing key, with the two
//! secondary lookups (due time, URL) backed by indexes. `queue_settings` and
//! `queue_stats` are single-row tables. Timestamps are stored as epoch
//! milliseconds so the dead-letter sentinel sorts after every real due time.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use pagequeue_core::{RecordKey, never};

use super::store::{QueueStore, StoreError};
use super::types::{QueueRecord, QueueStats, Settings};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_records (
        id                TEXT PRIMARY KEY,
        url               TEXT NOT NULL,
        title             TEXT NOT NULL,
        payload           TEXT NOT NULL,
        first_enqueued_at INTEGER NOT NULL,
        last_updated_at   INTEGER NOT NULL,
        attempt           INTEGER NOT NULL,
        next_attempt_at   INTEGER NOT NULL,
        last_error        TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_records_next_attempt ON queue_records (next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_queue_records_url ON queue_records (url)",
    r#"
    CREATE TABLE IF NOT EXISTS queue_settings (
        id            INTEGER PRIMARY KEY CHECK (id = 1),
        paused        INTEGER NOT NULL,
        model_version TEXT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_stats (
        id            INTEGER PRIMARY KEY CHECK (id = 1),
        processed     INTEGER NOT NULL,
        succeeded     INTEGER NOT NULL,
        failed        INTEGER NOT NULL,
        dead_lettered INTEGER NOT NULL,
        last_tick_at  INTEGER NULL
    )
    "#,
];

const COALESCE_ROUNDS: usize = 3;

const RECORD_COLUMNS: &str = "id, url, title, payload, first_enqueued_at, last_updated_at, \
                              attempt, next_attempt_at, last_error";

/// SQLite-backed queue store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    /// Connect to `url` (e.g. `sqlite://queue.db`), creating the file and schema if missing.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid SQLite URL {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open queue database at {url}"))?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory SQLite URL")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory queue database")?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to create queue schema")?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    if ms == to_millis(never()) {
        return Ok(never());
    }
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {ms}")))
}

fn count_to_sql(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn count_from_sql(n: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative {column}: {n}")))
}

fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map a database row into a `QueueRecord`.
fn row_to_record(row: SqliteRow) -> Result<QueueRecord, StoreError> {
    let id_str: String = row.try_get("id")?;
    let id = RecordKey::from_str(&id_str).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let payload_str: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| StoreError::Corrupt(format!("payload of {id_str}: {e}")))?;

    let attempt: i64 = row.try_get("attempt")?;
    let attempt = u32::try_from(attempt)
        .map_err(|_| StoreError::Corrupt(format!("attempt of {id_str}: {attempt}")))?;

    Ok(QueueRecord {
        id,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        payload,
        first_enqueued_at: from_millis(row.try_get("first_enqueued_at")?, "first_enqueued_at")?,
        last_updated_at: from_millis(row.try_get("last_updated_at")?, "last_updated_at")?,
        attempt,
        next_attempt_at: from_millis(row.try_get("next_attempt_at")?, "next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_settings(row: SqliteRow) -> Result<Settings, StoreError> {
    Ok(Settings {
        paused: row.try_get("paused")?,
        model_version: row.try_get("model_version")?,
    })
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<QueueRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM queue_records WHERE id = ?1"))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_record).transpose()
    }

    async fn upsert(&self, record: &QueueRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO queue_records (
                id, url, title, payload, first_enqueued_at, last_updated_at,
                attempt, next_attempt_at, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                payload = excluded.payload,
                first_enqueued_at = excluded.first_enqueued_at,
                last_updated_at = excluded.last_updated_at,
                attempt = excluded.attempt,
                next_attempt_at = excluded.next_attempt_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.url)
        .bind(&record.title)
        .bind(record.payload.to_string())
        .bind(to_millis(record.first_enqueued_at))
        .bind(to_millis(record.last_updated_at))
        .bind(i64::from(record.attempt))
        .bind(to_millis(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn coalesce_or_insert(&self, fresh: &QueueRecord) -> Result<Option<QueueRecord>, StoreError> {
        let update = format!(
            "UPDATE queue_records SET url = ?2, title = ?3, payload = ?4, last_updated_at = ?5 \
             WHERE id = ?1 RETURNING {RECORD_COLUMNS}"
        );

        // The row can disappear between the two statements (a tick removed it);
        // the next round then inserts it again.
        for _ in 0..COALESCE_ROUNDS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO queue_records (
                    id, url, title, payload, first_enqueued_at, last_updated_at,
                    attempt, next_attempt_at, last_error
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(fresh.id.as_str())
            .bind(&fresh.url)
            .bind(&fresh.title)
            .bind(fresh.payload.to_string())
            .bind(to_millis(fresh.first_enqueued_at))
            .bind(to_millis(fresh.last_updated_at))
            .bind(i64::from(fresh.attempt))
            .bind(to_millis(fresh.next_attempt_at))
            .bind(fresh.last_error.as_deref())
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() > 0 {
                return Ok(None);
            }

            let merged = sqlx::query(&update)
                .bind(fresh.id.as_str())
                .bind(&fresh.url)
                .bind(&fresh.title)
                .bind(fresh.payload.to_string())
                .bind(to_millis(fresh.last_updated_at))
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = merged {
                return row_to_record(row).map(Some);
            }
        }

        Err(StoreError::Storage(format!(
            "record {} kept changing during coalesce",
            fresh.id
        )))
    }

    async fn save_retry_state(&self, record: &QueueRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_records
            SET attempt = ?2, next_attempt_at = ?3, last_error = ?4, last_updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(record.id.as_str())
        .bind(i64::from(record.attempt))
        .bind(to_millis(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .bind(to_millis(record.last_updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queue_records WHERE id = ?1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM queue_records \
             WHERE next_attempt_at <= ?1 AND next_attempt_at < ?2 \
             ORDER BY first_enqueued_at ASC, id ASC LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now))
            .bind(to_millis(never()))
            .bind(limit_to_sql(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn by_url(&self, url: &str) -> Result<Vec<QueueRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM queue_records WHERE url = ?1 \
             ORDER BY first_enqueued_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(url).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM queue_records WHERE next_attempt_at = ?1 \
             ORDER BY first_enqueued_at ASC, id ASC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(never()))
            .bind(limit_to_sql(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn settings(&self) -> Result<Settings, StoreError> {
        let row = sqlx::query("SELECT paused, model_version FROM queue_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_settings)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    async fn set_paused(&self, paused: bool) -> Result<Settings, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_settings (id, paused, model_version)
            VALUES (1, ?1, NULL)
            ON CONFLICT(id) DO UPDATE SET paused = excluded.paused
            RETURNING paused, model_version
            "#,
        )
        .bind(paused)
        .fetch_one(&self.pool)
        .await?;
        row_to_settings(row)
    }

    async fn set_model_version(&self, version: Option<String>) -> Result<Settings, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_settings (id, paused, model_version)
            VALUES (1, 0, ?1)
            ON CONFLICT(id) DO UPDATE SET model_version = excluded.model_version
            RETURNING paused, model_version
            "#,
        )
        .bind(version.as_deref())
        .fetch_one(&self.pool)
        .await?;
        row_to_settings(row)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            "SELECT processed, succeeded, failed, dead_lettered, last_tick_at FROM queue_stats WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(QueueStats::default());
        };

        let last_tick_at: Option<i64> = row.try_get("last_tick_at")?;
        Ok(QueueStats {
            processed: count_from_sql(row.try_get("processed")?, "processed")?,
            succeeded: count_from_sql(row.try_get("succeeded")?, "succeeded")?,
            failed: count_from_sql(row.try_get("failed")?, "failed")?,
            dead_lettered: count_from_sql(row.try_get("dead_lettered")?, "dead_lettered")?,
            last_tick_at: last_tick_at
                .map(|ms| from_millis(ms, "last_tick_at"))
                .transpose()?,
        })
    }

    async fn save_stats(&self, stats: &QueueStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO queue_stats (id, processed, succeeded, failed, dead_lettered, last_tick_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                processed = excluded.processed,
                succeeded = excluded.succeeded,
                failed = excluded.failed,
                dead_lettered = excluded.dead_lettered,
                last_tick_at = excluded.last_tick_at
            "#,
        )
        .bind(count_to_sql(stats.processed))
        .bind(count_to_sql(stats.succeeded))
        .bind(count_to_sql(stats.failed))
        .bind(count_to_sql(stats.dead_lettered))
        .bind(stats.last_tick_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::queue::types::PageEvent;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn record(url: &str, first_ms: i64) -> QueueRecord {
        QueueRecord::new(
            RecordKey::derive(url, at(first_ms), Duration::from_secs(600)),
            PageEvent::new(url, format!("title of {url}"))
                .with_payload(serde_json::json!({ "source": "tab" })),
            at(first_ms),
        )
    }

    #[tokio::test]
    async fn upsert_then_get_preserves_every_field() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let mut rec = record("https://a.com", 42);
        rec.attempt = 3;
        rec.last_error = Some("timeout".into());
        rec.next_attempt_at = at(90_000);

        store.upsert(&rec).await.unwrap();
        let loaded = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let mut rec = record("https://a.com", 0);
        store.upsert(&rec).await.unwrap();

        rec.title = "renamed".into();
        store.upsert(&rec).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&rec.id).await.unwrap().unwrap().title, "renamed");
    }

    #[tokio::test]
    async fn due_orders_fifo_and_skips_dead_letters() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        for (url, first) in [("https://e.com", 5), ("https://a.com", 1), ("https://c.com", 3)] {
            store.upsert(&record(url, first)).await.unwrap();
        }
        let mut dead = record("https://dead.com", 0);
        dead.next_attempt_at = never();
        store.upsert(&dead).await.unwrap();

        let due = store.due(at(10), 10).await.unwrap();
        let order: Vec<_> = due.iter().map(|r| r.first_enqueued_at.timestamp_millis()).collect();
        assert_eq!(order, vec![1, 3, 5]);

        let dead_letters = store.dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert!(dead_letters[0].is_dead_letter());
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let rec = record("https://a.com", 0);
        store.upsert(&rec).await.unwrap();

        assert!(store.remove(&rec.id).await.unwrap());
        assert!(!store.remove(&rec.id).await.unwrap());
        assert!(store.by_url("https://a.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn coalesce_leaves_retry_state_of_dead_letter() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let first = record("https://a.com", 0);
        assert!(store.coalesce_or_insert(&first).await.unwrap().is_none());

        let mut dead = first.clone();
        dead.attempt = 2;
        dead.next_attempt_at = never();
        dead.last_error = Some("malformed".into());
        dead.last_updated_at = at(3_000);
        assert!(store.save_retry_state(&dead).await.unwrap());

        let mut fresh = record("https://a.com", 7_000);
        fresh.id = first.id.clone();
        fresh.title = "second visit".into();
        let merged = store.coalesce_or_insert(&fresh).await.unwrap().unwrap();

        assert_eq!(merged.title, "second visit");
        assert_eq!(merged.last_updated_at, at(7_000));
        assert_eq!(merged.first_enqueued_at, at(0));
        assert_eq!(merged.attempt, 2);
        assert!(merged.is_dead_letter());
        assert_eq!(merged.last_error.as_deref(), Some("malformed"));
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.due(at(10_000), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_retry_state_only_writes_retry_columns() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let original = record("https://a.com", 0);
        store.upsert(&original).await.unwrap();

        let mut settled = original.clone();
        settled.title = "title seen at dispatch".into();
        settled.attempt = 1;
        settled.next_attempt_at = at(20_000);
        settled.last_error = Some("timeout".into());
        assert!(store.save_retry_state(&settled).await.unwrap());

        let stored = store.get(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.title, original.title);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.next_attempt_at, at(20_000));

        store.remove(&original.id).await.unwrap();
        assert!(!store.save_retry_state(&settled).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn settings_fields_are_written_independently() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        assert_eq!(store.settings().await.unwrap(), Settings::default());

        let settings = store.set_model_version(Some("embed-v2".into())).await.unwrap();
        assert!(!settings.paused);
        assert_eq!(settings.model_version.as_deref(), Some("embed-v2"));

        let settings = store.set_paused(true).await.unwrap();
        assert_eq!(settings.model_version.as_deref(), Some("embed-v2"));

        let settings = store.set_model_version(None).await.unwrap();
        assert!(settings.paused);
        assert_eq!(store.settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let stats = QueueStats {
            processed: 4,
            succeeded: 2,
            failed: 2,
            dead_lettered: 1,
            last_tick_at: Some(at(1_234)),
        };
        store.save_stats(&stats).await.unwrap();
        assert_eq!(store.stats().await.unwrap(), stats);
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let store = SqliteQueueStore::in_memory().await.unwrap();
        let again = SqliteQueueStore::from_pool(store.pool().clone()).await;
        assert!(again.is_ok());
    }
}
