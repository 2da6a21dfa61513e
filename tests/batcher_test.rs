use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pushserver::batcher::{Batcher, BatcherConfig, QueueError};
use pushserver::fcm::{PushSender, SendError};
use pushserver::store::{Batch, QueuedNotification, StatusState, Store};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SendCall {
    token: String,
    data_ids: Vec<Vec<u8>>,
}

#[derive(Clone, Default)]
struct RecordingSender {
    responses: Arc<Mutex<VecDeque<Result<(), SendError>>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
    delay: Option<Duration>,
}

impl RecordingSender {
    fn with_responses(responses: Vec<Result<(), SendError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PushSender for RecordingSender {
    async fn send(&self, fcm_token: &str, data_ids: &[Vec<u8>]) -> Result<(), SendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().await.push(SendCall {
            token: fcm_token.to_string(),
            data_ids: data_ids.to_vec(),
        });
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

fn config(window: Duration, max_size: usize) -> BatcherConfig {
    BatcherConfig {
        batch_window: window,
        max_batch_size: max_size,
        lock_timeout: Duration::from_millis(100),
        status_retention: Duration::from_secs(3600),
    }
}

async fn setup(
    sender: RecordingSender,
    window: Duration,
    max_size: usize,
) -> (Arc<Store>, Arc<Batcher>) {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let batcher = Batcher::new(
        Arc::clone(&store),
        Arc::new(sender),
        config(window, max_size),
    );
    (store, batcher)
}

#[tokio::test]
async fn time_trigger_flushes_within_window() {
    let sender = RecordingSender::default();
    let (store, batcher) = setup(sender.clone(), Duration::from_millis(100), 100).await;

    let cancel = CancellationToken::new();
    let request_id = batcher
        .queue("token-1", vec![vec![0x01, 0x02, 0x03]], &cancel)
        .await
        .unwrap();

    // Still queued: no status row yet, batch persisted.
    assert!(batcher.get_status(&request_id).await.unwrap().is_none());
    assert_eq!(store.load_oldest_batches(10).await.unwrap().len(), 1);
    assert!(sender.calls().await.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].token, "token-1");
    assert_eq!(calls[0].data_ids, vec![vec![0x01, 0x02, 0x03]]);

    let status = batcher.get_status(&request_id).await.unwrap().unwrap();
    assert_eq!(status.state, StatusState::Sent);
    assert!(status.sent_at.is_some());
    assert!(status.expires_at > status.sent_at.unwrap());
    assert!(store.load_oldest_batches(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn size_trigger_flushes_exactly_once() {
    let sender = RecordingSender::default();
    let (store, batcher) = setup(sender.clone(), Duration::from_secs(60), 5).await;

    let cancel = CancellationToken::new();
    for i in 0u8..5 {
        batcher
            .queue("token-1", vec![vec![i]], &cancel)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].data_ids,
        vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
    );
    assert!(store.load_oldest_batches(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn coalesced_payloads_keep_insertion_order() {
    let sender = RecordingSender::default();
    let (_store, batcher) = setup(sender.clone(), Duration::from_millis(150), 100).await;

    let cancel = CancellationToken::new();
    for i in 0u8..3 {
        batcher
            .queue("token-1", vec![vec![i, i], vec![i]], &cancel)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].data_ids,
        vec![
            vec![0, 0],
            vec![0],
            vec![1, 1],
            vec![1],
            vec![2, 2],
            vec![2]
        ]
    );
}

#[tokio::test]
async fn endpoints_batch_independently() {
    let sender = RecordingSender::default();
    let (_store, batcher) = setup(sender.clone(), Duration::from_millis(100), 100).await;

    let cancel = CancellationToken::new();
    batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap();
    batcher
        .queue("token-2", vec![vec![0x02]], &cancel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut calls = sender.calls().await;
    calls.sort_by(|a, b| a.token.cmp(&b.token));
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].token, "token-1");
    assert_eq!(calls[0].data_ids, vec![vec![0x01]]);
    assert_eq!(calls[1].token, "token-2");
    assert_eq!(calls[1].data_ids, vec![vec![0x02]]);
}

#[tokio::test]
async fn failed_send_publishes_failed_status() {
    let sender = RecordingSender::with_responses(vec![Err(SendError::Provider("boom".into()))]);
    let (_store, batcher) = setup(sender.clone(), Duration::from_millis(100), 100).await;

    let cancel = CancellationToken::new();
    let request_id = batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = batcher.get_status(&request_id).await.unwrap().unwrap();
    assert_eq!(status.state, StatusState::Failed);
    assert!(status.sent_at.is_none());
    assert!(status.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn shared_request_id_tracks_multi_endpoint_fanout() {
    let sender = RecordingSender::default();
    let (_store, batcher) = setup(sender.clone(), Duration::from_millis(100), 100).await;

    let cancel = CancellationToken::new();
    let request_id = "shared-request";
    batcher
        .queue_with_request_id("token-1", vec![vec![0x01]], request_id, &cancel)
        .await
        .unwrap();
    batcher
        .queue_with_request_id("token-2", vec![vec![0x01]], request_id, &cancel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(sender.calls().await.len(), 2);
    let status = batcher.get_status(request_id).await.unwrap().unwrap();
    assert_eq!(status.state, StatusState::Sent);
}

#[tokio::test]
async fn stop_rejects_new_queues_and_leaves_disk_state() {
    let sender = RecordingSender::default();
    let (store, batcher) = setup(sender.clone(), Duration::from_secs(60), 100).await;

    let cancel = CancellationToken::new();
    batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap();

    batcher.stop();
    batcher.stop(); // idempotent

    let err = batcher
        .queue("token-1", vec![vec![0x02]], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Stopped));

    // The timer was cancelled; nothing flushes and the persisted batch
    // stays for the next process.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sender.calls().await.is_empty());
    assert_eq!(store.load_oldest_batches(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_caller_is_not_admitted() {
    let sender = RecordingSender::default();
    let (store, batcher) = setup(sender.clone(), Duration::from_secs(60), 100).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Cancelled));
    assert!(store.load_oldest_batches(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_times_out_while_flush_holds_the_endpoint_lock() {
    // max_size 1 makes the first queue trigger an immediate flush, which
    // holds the endpoint lock while the sender sleeps.
    let sender = RecordingSender::with_delay(Duration::from_millis(600));
    let (_store, batcher) = setup(sender.clone(), Duration::from_secs(60), 1).await;

    let cancel = CancellationToken::new();
    batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap();

    // Let the flush task grab the lock before contending with it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = batcher
        .queue("token-1", vec![vec![0x02]], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LockTimeout));

    // The in-flight flush still completes normally.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let calls = sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].data_ids, vec![vec![0x01]]);
}

#[tokio::test]
async fn recover_flushes_everything_left_on_disk() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let now = Utc::now();
    for (token, request_id, payload) in [
        ("token-1", "req-1", vec![0x0A]),
        ("token-2", "req-2", vec![0x0B]),
    ] {
        store
            .save_batch(
                token,
                &Batch {
                    notifications: vec![QueuedNotification {
                        data_ids: vec![payload],
                        request_id: request_id.to_string(),
                    }],
                    created_at: now,
                    flush_at: now + Duration::from_secs(60),
                },
            )
            .await
            .unwrap();
    }

    let sender = RecordingSender::default();
    let batcher = Batcher::new(
        Arc::clone(&store),
        Arc::new(sender.clone()),
        config(Duration::from_secs(60), 100),
    );
    batcher.recover().await.unwrap();

    let mut calls = sender.calls().await;
    calls.sort_by(|a, b| a.token.cmp(&b.token));
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].data_ids, vec![vec![0x0A]]);
    assert_eq!(calls[1].data_ids, vec![vec![0x0B]]);

    assert!(store.load_oldest_batches(10).await.unwrap().is_empty());
    for request_id in ["req-1", "req-2"] {
        let status = batcher.get_status(request_id).await.unwrap().unwrap();
        assert_eq!(status.state, StatusState::Sent);
    }
}

#[tokio::test]
async fn recover_on_empty_store_is_noop() {
    let sender = RecordingSender::default();
    let (_store, batcher) = setup(sender.clone(), Duration::from_secs(60), 100).await;
    batcher.recover().await.unwrap();
    assert!(sender.calls().await.is_empty());
}

#[tokio::test]
async fn new_batch_opens_after_flush_completes() {
    let sender = RecordingSender::default();
    let (_store, batcher) = setup(sender.clone(), Duration::from_millis(100), 100).await;

    let cancel = CancellationToken::new();
    let first = batcher
        .queue("token-1", vec![vec![0x01]], &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = batcher
        .queue("token-1", vec![vec![0x02]], &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].data_ids, vec![vec![0x01]]);
    assert_eq!(calls[1].data_ids, vec![vec![0x02]]);

    for request_id in [first, second] {
        let status = batcher.get_status(&request_id).await.unwrap().unwrap();
        assert_eq!(status.state, StatusState::Sent);
    }
}
