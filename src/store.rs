//! SQLite persistence for pending batches and delivery status.
//!
//! Single-writer discipline: every mutating operation serializes behind
//! `write_lock`; reads go straight to the pool. The pool holds one
//! connection and the database runs in WAL mode.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::instrument;

/// Terminal delivery state. The `queued` state is implicit: a request that
/// has no status row is still waiting in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Sent,
    Failed,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Sent => "sent",
            StatusState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(StatusState::Sent),
            "failed" => Ok(StatusState::Failed),
            other => Err(anyhow!("unknown status state {other:?}")),
        }
    }
}

/// A single queued push: the content ids from one accepted request plus the
/// gateway-minted request id used for status tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedNotification {
    pub data_ids: Vec<Vec<u8>>,
    pub request_id: String,
}

/// Queued notifications for a single FCM token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub notifications: Vec<QueuedNotification>,
    pub created_at: DateTime<Utc>,
    pub flush_at: DateTime<Utc>,
}

/// Delivery status of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: StatusState,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Versioned on-disk form of the notifications column. The version field
/// lets a future schema read old rows after a restart across releases.
#[derive(Serialize, Deserialize)]
struct NotificationsBlob {
    version: u32,
    notifications: Vec<QueuedNotification>,
}

const BLOB_VERSION: u32 = 1;

fn serialize_notifications(notifications: &[QueuedNotification]) -> Result<Vec<u8>> {
    serde_json::to_vec(&NotificationsBlob {
        version: BLOB_VERSION,
        notifications: notifications.to_vec(),
    })
    .context("serializing notifications")
}

fn deserialize_notifications(data: &[u8]) -> Result<Vec<QueuedNotification>> {
    let blob: NotificationsBlob =
        serde_json::from_slice(data).context("deserializing notifications")?;
    if blob.version != BLOB_VERSION {
        return Err(anyhow!("unsupported notifications blob version {}", blob.version));
    }
    Ok(blob.notifications)
}

pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (or create) the database file at `path` and run migrations.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating storage directory")?;
            }
        }
        let url = format!("sqlite://{path}?mode=rwc");
        Self::connect(&url).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .context("opening database")?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running migrations")?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Upsert the batch for `fcm_token`, replacing any prior row.
    #[instrument(skip_all)]
    pub async fn save_batch(&self, fcm_token: &str, batch: &Batch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let blob = serialize_notifications(&batch.notifications)?;
        sqlx::query(
            "INSERT OR REPLACE INTO batches (fcm_token, notifications, created_at, flush_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(fcm_token)
        .bind(blob)
        .bind(batch.created_at.timestamp())
        .bind(batch.flush_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load up to `limit` batches ordered by ascending `flush_at`.
    /// Returns fewer than `limit` entries when no more batches exist.
    pub async fn load_oldest_batches(&self, limit: i64) -> Result<Vec<(String, Batch)>> {
        let rows = sqlx::query(
            "SELECT fcm_token, notifications, created_at, flush_at \
             FROM batches ORDER BY flush_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            let fcm_token: String = row.get("fcm_token");
            let blob: Vec<u8> = row.get("notifications");
            let notifications = deserialize_notifications(&blob)
                .with_context(|| format!("batch for token {fcm_token}"))?;
            batches.push((
                fcm_token,
                Batch {
                    notifications,
                    created_at: timestamp(row.get("created_at"))?,
                    flush_at: timestamp(row.get("flush_at"))?,
                },
            ));
        }
        Ok(batches)
    }

    /// Atomically delete the batch for `fcm_token` and upsert a status row
    /// for every request id it contained. A missing batch is a no-op.
    #[instrument(skip_all)]
    pub async fn delete_batch_and_set_status(&self, fcm_token: &str, status: &Status) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT notifications FROM batches WHERE fcm_token = ?")
            .bind(fcm_token)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let blob: Vec<u8> = row.get("notifications");
        let notifications = deserialize_notifications(&blob)?;

        sqlx::query("DELETE FROM batches WHERE fcm_token = ?")
            .bind(fcm_token)
            .execute(&mut *tx)
            .await?;

        for notif in &notifications {
            sqlx::query(
                "INSERT OR REPLACE INTO status (request_id, state, sent_at, error, expires_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&notif.request_id)
            .bind(status.state.as_str())
            .bind(status.sent_at.map(|t| t.timestamp()))
            .bind(status.error.as_deref())
            .bind(status.expires_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Look up the delivery status for a request. `None` means the request
    /// is unknown: never admitted, still queued, or already expired.
    pub async fn get_status(&self, request_id: &str) -> Result<Option<Status>> {
        let row = sqlx::query(
            "SELECT state, sent_at, error, expires_at FROM status WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.get("state");
        let sent_at: Option<i64> = row.get("sent_at");
        let error: Option<String> = row.get("error");
        Ok(Some(Status {
            state: StatusState::parse(&state)?,
            sent_at: sent_at.map(timestamp).transpose()?,
            error,
            expires_at: timestamp(row.get("expires_at"))?,
        }))
    }

    /// Delete status rows whose `expires_at` has passed. Returns the count.
    #[instrument(skip_all)]
    pub async fn cleanup_expired_status(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM status WHERE expires_at < ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp {secs} out of range"))
}
