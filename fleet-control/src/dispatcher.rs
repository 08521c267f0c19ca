//! Dispatcher (C10): worker loop that drains C6, asks C8 for an endpoint,
//! forwards the request over HTTP, and releases the endpoint. Grounded in
//! the dispatch loop described in spec §4.10 (no direct Python counterpart
//! file — `request_api.py` plays the equivalent role of driving dispatch
//! from the HTTP layer in the original).
//!
//! Multiple workers may run in parallel; each worker resolves its own
//! endpoint back to an `instance_id` and releases it on the same task that
//! acquired it, so the load balancer's in-flight counts never need
//! cross-worker coordination beyond the mutex already inside it (spec §5).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::balancer::LoadBalancer;
use crate::manager::DeploymentManager;
use crate::queue::RequestQueue;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_secs(1);
const NO_ENDPOINT_SLEEP: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    balancer: Arc<LoadBalancer>,
    manager: Arc<DeploymentManager>,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(queue: Arc<RequestQueue>, balancer: Arc<LoadBalancer>, manager: Arc<DeploymentManager>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            queue,
            balancer,
            manager,
            http,
        }
    }

    /// Runs one worker loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
    }

    async fn tick(&self) {
        // Step 1.
        let Some(item) = self.queue.dequeue().await else {
            tokio::time::sleep(IDLE_SLEEP).await;
            return;
        };

        // Step 2.
        let active = self.manager.active_endpoints().await;
        let Some(instance_id) = self.balancer.acquire(&active).await else {
            self.queue.requeue(item).await;
            tokio::time::sleep(NO_ENDPOINT_SLEEP).await;
            return;
        };

        let Some(replica) = active.iter().find(|r| r.instance_id == instance_id) else {
            // Resolved an instance id that vanished between acquire and
            // lookup; treat as a transient failure and re-enqueue.
            self.balancer.release(&instance_id).await;
            self.queue.requeue(item).await;
            return;
        };

        // Step 3 & 4.
        let url = format!("http://{}/query", replica.endpoint);
        let delivered = match self.http.post(&url).json(&item.payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(_) => false,
            Err(_) => false,
        };

        if !delivered {
            self.queue.requeue(item).await;
        }

        // Step 5: always release, resolving back by instance_id (already in
        // hand here since acquire returned it directly).
        self.balancer.release(&instance_id).await;
    }
}
