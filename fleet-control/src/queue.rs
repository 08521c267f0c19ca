//! Request Queue (C6): FIFO store of pending inference requests, each with
//! a unique identifier. Grounded in
//! `original_source/core/model_deployer/multi_cluster/request_queue.py`.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// `{request_id, payload, enqueued_at}`. FIFO-ordered; removed from the
/// queue only when the dispatcher has acquired it for dispatch — there is
/// no ack protocol, the dispatcher re-enqueues on transient failure.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: Uuid,
    pub payload: Value,
    pub enqueued_at: u64,
}

#[derive(Default)]
pub struct RequestQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, payload: Value) -> Uuid {
        let request_id = Uuid::new_v4();
        let item = QueuedRequest {
            request_id,
            payload,
            enqueued_at: now_unix(),
        };
        self.items.lock().await.push_back(item);
        request_id
    }

    /// Re-enqueues an item that the dispatcher failed to deliver, preserving
    /// its original `request_id` and `enqueued_at` (spec scenario 5).
    pub async fn requeue(&self, item: QueuedRequest) {
        self.items.lock().await.push_back(item);
    }

    /// Non-blocking pop from the head.
    pub async fn dequeue(&self) -> Option<QueuedRequest> {
        self.items.lock().await.pop_front()
    }

    pub async fn length(&self) -> usize {
        self.items.lock().await.len()
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips_payload() {
        let queue = RequestQueue::new();
        let payload = serde_json::json!({"prompt": "hello"});
        let id = queue.enqueue(payload.clone()).await;

        let item = queue.dequeue().await.unwrap();
        assert_eq!(item.request_id, id);
        assert_eq!(item.payload, payload);
        assert_eq!(queue.length().await, 0);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none() {
        let queue = RequestQueue::new();
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn fifo_ordering_is_preserved() {
        let queue = RequestQueue::new();
        let first = queue.enqueue(serde_json::json!(1)).await;
        let second = queue.enqueue(serde_json::json!(2)).await;

        assert_eq!(queue.dequeue().await.unwrap().request_id, first);
        assert_eq!(queue.dequeue().await.unwrap().request_id, second);
    }

    #[tokio::test]
    async fn requeue_preserves_request_id() {
        let queue = RequestQueue::new();
        let id = queue.enqueue(serde_json::json!("x")).await;
        let item = queue.dequeue().await.unwrap();
        assert_eq!(item.request_id, id);

        queue.requeue(item).await;
        assert_eq!(queue.length().await, 1);
        let requeued = queue.dequeue().await.unwrap();
        assert_eq!(requeued.request_id, id);
    }
}
