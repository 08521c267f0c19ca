//! Load Balancer (C8): selects a replica endpoint per outgoing request
//! under one of three selection strategies. Grounded in
//! `original_source/.../load_balancer.py`.
//!
//! Per spec §5, connection counts are touched only by dispatcher workers;
//! acquire and release for the same request happen on the same worker, so
//! counts are naturally partitioned per instance and only need a lock
//! around the shared map, not per-request coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use deploy_core::config::LbStrategy;
use deploy_core::ReplicaRecord;
use rand::Rng;
use tokio::sync::Mutex;

pub struct LoadBalancer {
    strategy: LbStrategy,
    round_robin_index: AtomicUsize,
    in_flight: Mutex<HashMap<String, u32>>,
}

impl LoadBalancer {
    pub fn new(strategy: LbStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// If `active` is empty, returns `None` — the dispatcher must not
    /// dequeue in that case (spec §4.8).
    pub async fn acquire(&self, active: &[ReplicaRecord]) -> Option<String> {
        if active.is_empty() {
            return None;
        }

        match self.strategy {
            LbStrategy::RoundRobin => {
                let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % active.len();
                Some(active[idx].instance_id.clone())
            }
            LbStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..active.len());
                Some(active[idx].instance_id.clone())
            }
            LbStrategy::LeastConnections => {
                let mut counts = self.in_flight.lock().await;
                self.reconcile(&mut counts, active);

                let chosen = active
                    .iter()
                    .min_by_key(|r| *counts.get(&r.instance_id).unwrap_or(&0))
                    .map(|r| r.instance_id.clone())?;
                *counts.entry(chosen.clone()).or_insert(0) += 1;
                Some(chosen)
            }
        }
    }

    /// Clamped at 0 — releasing more times than acquired never underflows.
    pub async fn release(&self, instance_id: &str) {
        if let LbStrategy::LeastConnections = self.strategy {
            let mut counts = self.in_flight.lock().await;
            if let Some(count) = counts.get_mut(instance_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Stale-entry reconciliation: newly-seen instances initialize to 0;
    /// instances no longer in the active set are dropped. Runs on every
    /// acquire under least-connections.
    fn reconcile(&self, counts: &mut HashMap<String, u32>, active: &[ReplicaRecord]) {
        for replica in active {
            counts.entry(replica.instance_id.clone()).or_insert(0);
        }
        let active_ids: std::collections::HashSet<&str> =
            active.iter().map(|r| r.instance_id.as_str()).collect();
        counts.retain(|id, _| active_ids.contains(id.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::ReplicaStatus;

    fn replica(id: &str) -> ReplicaRecord {
        ReplicaRecord {
            instance_id: id.to_string(),
            container_id: format!("container-{id}"),
            cluster_ref: "c1".to_string(),
            endpoint: format!("{id}:8000"),
            status: ReplicaStatus::Running,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn round_robin_distributes_evenly_across_three_replicas() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let replicas = vec![replica("a"), replica("b"), replica("c")];
        let mut counts = HashMap::new();
        for _ in 0..9 {
            let id = lb.acquire(&replicas).await.unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 3);
        assert_eq!(counts["c"], 3);
    }

    #[tokio::test]
    async fn acquire_on_empty_active_set_returns_none() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        assert!(lb.acquire(&[]).await.is_none());
    }

    #[tokio::test]
    async fn least_connections_with_one_instance_always_selects_it() {
        let lb = LoadBalancer::new(LbStrategy::LeastConnections);
        let replicas = vec![replica("only")];
        for _ in 0..5 {
            let id = lb.acquire(&replicas).await.unwrap();
            assert_eq!(id, "only");
        }
    }

    #[tokio::test]
    async fn least_connections_prefers_instance_with_fewer_in_flight() {
        let lb = LoadBalancer::new(LbStrategy::LeastConnections);
        let replicas = vec![replica("a"), replica("b")];

        let first = lb.acquire(&replicas).await.unwrap();
        let second = lb.acquire(&replicas).await.unwrap();
        assert_ne!(first, second);

        lb.release(&first).await;
        let third = lb.acquire(&replicas).await.unwrap();
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn release_is_clamped_at_zero() {
        let lb = LoadBalancer::new(LbStrategy::LeastConnections);
        lb.release("never-acquired").await;
        // no panic, no underflow
    }
}
