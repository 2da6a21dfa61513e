//! Notification batching with persistence and timed flushing.
//!
//! Notifications coalesce per FCM token. A batch opens on first admission,
//! persists on every change, and flushes when its window timer fires or it
//! reaches the size cap. Exactly one flush runs per endpoint at a time: the
//! per-endpoint mutex holds the open batch, so queueing and flushing the
//! same endpoint serialize while distinct endpoints proceed in parallel.
//! The engine-wide lock guards only the entry and timer maps and is never
//! held across I/O or the endpoint lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::fcm::PushSender;
use crate::store::{Batch, QueuedNotification, Status, StatusState, Store};

const RECOVER_PAGE_SIZE: i64 = 100;

/// Admission failure. Delivery is best-effort: a rejected notification is
/// simply dropped and never sees a status row.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("timed out waiting for endpoint lock")]
    LockTimeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("batcher is stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_window: Duration,
    pub max_batch_size: usize,
    pub lock_timeout: Duration,
    pub status_retention: Duration,
}

/// The endpoint lock and the batch it guards. `None` means no open batch.
type EndpointEntry = Arc<AsyncMutex<Option<Batch>>>;

struct Inner {
    entries: HashMap<String, EndpointEntry>,
    timers: HashMap<String, JoinHandle<()>>,
    stopped: bool,
}

/// Queues notifications per endpoint and flushes them to the push provider.
pub struct Batcher {
    store: Arc<Store>,
    sender: Arc<dyn PushSender>,
    cfg: BatcherConfig,
    inner: StdMutex<Inner>,
}

impl Batcher {
    pub fn new(store: Arc<Store>, sender: Arc<dyn PushSender>, cfg: BatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            sender,
            cfg,
            inner: StdMutex::new(Inner {
                entries: HashMap::new(),
                timers: HashMap::new(),
                stopped: false,
            }),
        })
    }

    /// Admit a notification for coalesced delivery to `fcm_token`, minting a
    /// fresh request id for status tracking.
    pub async fn queue(
        self: &Arc<Self>,
        fcm_token: &str,
        data_ids: Vec<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<String, QueueError> {
        let request_id = Uuid::new_v4().to_string();
        self.queue_with_request_id(fcm_token, data_ids, &request_id, cancel)
            .await?;
        Ok(request_id)
    }

    /// Admit a notification under a caller-chosen request id. The request
    /// pipeline uses this to fan one request out to several endpoints while
    /// tracking them all under one id (last terminal write wins).
    pub async fn queue_with_request_id(
        self: &Arc<Self>,
        fcm_token: &str,
        data_ids: Vec<Vec<u8>>,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let entry = self.entry(fcm_token);

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            guard = entry.lock() => guard,
            _ = tokio::time::sleep(self.cfg.lock_timeout) => {
                error!(token = %fcm_token, "endpoint lock timeout, dropping notification");
                return Err(QueueError::LockTimeout);
            }
        };

        if self.inner.lock().unwrap().stopped {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now();
        let is_new_batch = guard.is_none();
        let batch = guard.get_or_insert_with(|| Batch {
            notifications: Vec::new(),
            created_at: now,
            flush_at: now + self.cfg.batch_window,
        });
        batch.notifications.push(QueuedNotification {
            data_ids,
            request_id: request_id.to_string(),
        });

        // Persist before any trigger fires, so a crash after this call
        // returns cannot lose the notification. On failure the batch stays
        // in memory and still flushes from there.
        if let Err(err) = self.store.save_batch(fcm_token, batch).await {
            error!(?err, token = %fcm_token, "failed to persist batch, continuing from memory");
        }

        if is_new_batch {
            self.start_timer(fcm_token, self.cfg.batch_window);
        }

        if batch.notifications.len() >= self.cfg.max_batch_size {
            self.stop_timer(fcm_token);
            let this = Arc::clone(self);
            let token = fcm_token.to_string();
            tokio::spawn(async move {
                this.flush(&token).await;
            });
        }

        Ok(())
    }

    fn entry(&self, fcm_token: &str) -> EndpointEntry {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .entry(fcm_token.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    fn start_timer(self: &Arc<Self>, fcm_token: &str, window: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        if let Some(old) = inner.timers.remove(fcm_token) {
            old.abort();
        }
        let this = Arc::clone(self);
        let token = fcm_token.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.flush(&token).await;
        });
        inner.timers.insert(fcm_token.to_string(), handle);
    }

    fn stop_timer(&self, fcm_token: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timers.remove(fcm_token) {
            timer.abort();
        }
    }

    /// Deliver the open batch for `fcm_token` and publish terminal status.
    /// Holds the endpoint lock for the duration, so a concurrent `queue` for
    /// the same token waits (bounded by its lock timeout).
    async fn flush(&self, fcm_token: &str) {
        let entry = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(fcm_token).cloned()
        };
        let Some(entry) = entry else {
            return;
        };

        let mut guard = entry.lock().await;
        let Some(batch) = guard.take() else {
            return;
        };
        if batch.notifications.is_empty() {
            return;
        }

        let all_data_ids: Vec<Vec<u8>> = batch
            .notifications
            .iter()
            .flat_map(|notif| notif.data_ids.iter().cloned())
            .collect();

        let now = Utc::now();
        let status = match self.sender.send(fcm_token, &all_data_ids).await {
            Ok(()) => Status {
                state: StatusState::Sent,
                sent_at: Some(now),
                error: None,
                expires_at: now + self.cfg.status_retention,
            },
            Err(err) => {
                error!(?err, token = %fcm_token, "flush failed");
                Status {
                    state: StatusState::Failed,
                    sent_at: None,
                    error: Some(err.to_string()),
                    expires_at: now + self.cfg.status_retention,
                }
            }
        };

        if let Err(err) = self.store.delete_batch_and_set_status(fcm_token, &status).await {
            error!(?err, token = %fcm_token, "failed to update status");
        }

        drop(guard);

        // The timer either fired (it is this task) or was size-cancelled;
        // either way its map slot is stale.
        self.inner.lock().unwrap().timers.remove(fcm_token);
    }

    /// Flush every batch left on disk by a previous process, oldest
    /// `flush_at` first. Call before accepting traffic.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let mut recovered = 0usize;
        loop {
            let batches = self.store.load_oldest_batches(RECOVER_PAGE_SIZE).await?;
            if batches.is_empty() {
                break;
            }
            let page_len = batches.len();
            for (fcm_token, batch) in batches {
                let entry = self.entry(&fcm_token);
                *entry.lock().await = Some(batch);
                self.flush(&fcm_token).await;
                recovered += 1;
            }
            if (page_len as i64) < RECOVER_PAGE_SIZE {
                break;
            }
            // Flushed batches are gone from the table, so the next page is
            // the new oldest.
        }
        if recovered > 0 {
            info!(recovered, "flushed batches recovered from disk");
        }
        Ok(())
    }

    /// Stop accepting notifications and cancel pending timers. In-flight
    /// flushes finish on their own; persisted batches stay on disk for the
    /// next process to recover. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
    }

    /// Delivery status for a request id, if a terminal state was published.
    pub async fn get_status(&self, request_id: &str) -> anyhow::Result<Option<Status>> {
        self.store.get_status(request_id).await
    }
}
