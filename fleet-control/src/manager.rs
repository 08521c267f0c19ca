//! Deployment Manager (C7): maintains the set of live replicas across
//! clusters; can add or remove replicas by invoking C5. Grounded in
//! `original_source/.../deployment_manager.py` and, for the
//! placement/labeling vocabulary, Materialize's
//! `ComputeOrchestrator::ensure_replica`.
//!
//! C7's replica map is the only writer-coordinated structure in the fleet
//! controller (spec §5): all mutation goes through the single `RwLock` held
//! here, readers take copy-on-read snapshots via [`DeploymentManager::active_endpoints`].

use std::collections::HashMap;
use std::sync::Arc;

use deploy_core::error::ConfigurationError;
use deploy_core::{
    shell::Shell, ClusterDescriptor, DeployError, DeployOptions, DeployOutcome,
    DeploymentExecutor, DeploymentSpec, ReplicaRecord, ReplicaStatus,
};
use tokio::sync::RwLock;

pub struct DeploymentManager {
    clusters: Vec<ClusterDescriptor>,
    replicas: RwLock<HashMap<String, ReplicaRecord>>,
    next_cluster: std::sync::atomic::AtomicUsize,
    executor: Arc<DeploymentExecutor>,
    spec: RwLock<DeploymentSpec>,
}

impl DeploymentManager {
    pub fn new(
        clusters: Vec<ClusterDescriptor>,
        executor: Arc<DeploymentExecutor>,
        spec: DeploymentSpec,
    ) -> Self {
        Self {
            clusters,
            replicas: RwLock::new(HashMap::new()),
            next_cluster: std::sync::atomic::AtomicUsize::new(0),
            executor,
            spec: RwLock::new(spec),
        }
    }

    pub async fn current_replica_count(&self) -> usize {
        self.replicas.read().await.len()
    }

    /// Only replicas with `status = running`.
    pub async fn active_endpoints(&self) -> Vec<ReplicaRecord> {
        self.replicas
            .read()
            .await
            .values()
            .filter(|r| r.status == ReplicaStatus::Running)
            .cloned()
            .collect()
    }

    pub async fn all_replicas(&self) -> Vec<ReplicaRecord> {
        self.replicas.read().await.values().cloned().collect()
    }

    pub fn find_cluster(&self, cluster_id: &str) -> Option<&ClusterDescriptor> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    /// If `n > current`, adds `n - current` replicas; else removes
    /// `current - n`. Running this twice in succession yields exactly `n`
    /// replicas, barring deploy failures (spec §8 idempotence law).
    ///
    /// Propagates `CapacityError` from a scale-up attempt (spec §4.7/§7) so
    /// the autoscaler can hold its cooldown instead of treating port
    /// exhaustion as a completed scaling action; every other deploy failure
    /// is logged and swallowed here, to be retried on the next tick.
    pub async fn scale_to(&self, n: usize) -> Result<(), DeployError> {
        let current = self.current_replica_count().await;
        if n > current {
            for _ in 0..(n - current) {
                self.add_replica().await?;
            }
        } else if n < current {
            self.remove_oldest(current - n).await;
        }
        Ok(())
    }

    /// Addition path: picks a cluster by round-robin over existing
    /// deployment count, instantiates C5 with that cluster's credentials
    /// and the stored spec. On a recoverable deploy failure the replica is
    /// not recorded and the error is logged so the scaler retries on the
    /// next tick; a `CapacityError` is instead bubbled up to the caller.
    async fn add_replica(&self) -> Result<(), DeployError> {
        let Some(cluster) = self.pick_cluster().cloned() else {
            log::warn!("deployment manager: no clusters configured, cannot add replica");
            return Ok(());
        };

        let mut spec = self.spec.read().await.clone();
        spec.credentials = cluster.credentials();

        match self.executor.deploy(&spec, DeployOptions::default()).await {
            Ok(outcome) => {
                self.register_replica(&cluster.cluster_id, &cluster.hostname, &outcome)
                    .await;
                Ok(())
            }
            Err(e @ DeployError::Capacity { .. }) => {
                log::warn!(
                    "deployment manager: capacity exhausted adding replica on {}: {e}",
                    cluster.cluster_id
                );
                Err(e)
            }
            Err(e) => {
                log::warn!("deployment manager: failed to add replica on {}: {e}", cluster.cluster_id);
                Ok(())
            }
        }
    }

    /// Records a replica that was already deployed by a direct C5
    /// invocation — the operator-driven counterpart to `add_replica`'s
    /// autoscaler-driven path, used by `POST /deploy` so the container it
    /// just stood up is immediately visible to the balancer, dispatcher and
    /// `/stats` (spec §2: "`deploy` invokes C5 ... to stand up replicas
    /// registered in C7").
    pub async fn register_replica(
        &self,
        cluster_id: &str,
        hostname: &str,
        outcome: &DeployOutcome,
    ) -> ReplicaRecord {
        let instance_id = ReplicaRecord::make_instance_id(cluster_id, &outcome.container_id);
        let endpoint = format!("{hostname}:{}", outcome.port_lease.remote_port);
        let record = ReplicaRecord {
            instance_id: instance_id.clone(),
            container_id: outcome.container_id.clone(),
            cluster_ref: cluster_id.to_string(),
            endpoint,
            status: ReplicaStatus::Running,
            created_at: now_unix(),
        };
        self.replicas.write().await.insert(instance_id, record.clone());
        record
    }

    /// Deploys `spec` to `cluster_id` directly and registers the result,
    /// the full path for `POST /deploy`. Also remembers `spec` as the
    /// template future autoscaler-driven replicas will reuse, so the model
    /// an operator just deployed is the one `scale_to` reproduces rather
    /// than an unrelated placeholder.
    pub async fn deploy_to(
        &self,
        cluster_id: &str,
        spec: DeploymentSpec,
        options: DeployOptions,
    ) -> Result<ReplicaRecord, DeployError> {
        let cluster = self
            .find_cluster(cluster_id)
            .cloned()
            .ok_or_else(|| DeployError::Configuration {
                stage: deploy_core::model::DeployStage::PreFlight,
                source: ConfigurationError::UnknownCluster(cluster_id.to_string()),
            })?;

        let outcome = self.executor.deploy(&spec, options).await?;
        let record = self
            .register_replica(&cluster.cluster_id, &cluster.hostname, &outcome)
            .await;
        *self.spec.write().await = spec;
        Ok(record)
    }

    /// Removal path: opens a shell to the replica's cluster, stops and
    /// removes the container, then drops the record. Stop/remove warnings
    /// are non-fatal. Removes the oldest replicas by `created_at` first.
    async fn remove_oldest(&self, count: usize) {
        let victims: Vec<ReplicaRecord> = {
            let mut all: Vec<ReplicaRecord> = self.replicas.read().await.values().cloned().collect();
            all.sort_by_key(|r| r.created_at);
            all.into_iter().take(count).collect()
        };

        for victim in victims {
            if let Some(cluster) = self.clusters.iter().find(|c| c.cluster_id == victim.cluster_ref) {
                if let Err(e) = self.stop_and_remove(cluster, &victim.container_id).await {
                    log::warn!("deployment manager: non-fatal error removing {}: {e}", victim.instance_id);
                }
            }
            self.replicas.write().await.remove(&victim.instance_id);
        }
    }

    async fn stop_and_remove(
        &self,
        cluster: &ClusterDescriptor,
        container_id: &str,
    ) -> Result<(), deploy_core::error::TransportError> {
        let shell = deploy_core::shell::RemoteShell::connect(&cluster.credentials()).await?;
        let _ = shell.exec(&format!("sudo docker stop {container_id}")).await;
        let _ = shell.exec(&format!("sudo docker rm -f {container_id}")).await;
        let _ = shell.close().await;
        Ok(())
    }

    fn pick_cluster(&self) -> Option<&ClusterDescriptor> {
        if self.clusters.is_empty() {
            return None;
        }
        let idx = self
            .next_cluster
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            % self.clusters.len();
        self.clusters.get(idx)
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
    use deploy_core::model::{ModelRef, ShellCredentials, ShellSecret};
    use std::path::PathBuf;

    fn cluster(id: &str) -> ClusterDescriptor {
        ClusterDescriptor {
            cluster_id: id.to_string(),
            hostname: format!("{id}.internal"),
            username: "deploy".to_string(),
            key_path: PathBuf::from("/home/deploy/.ssh/id_ed25519"),
        }
    }

    fn manager(clusters: Vec<ClusterDescriptor>) -> DeploymentManager {
        let docker = bollard::Docker::connect_with_local_defaults()
            .expect("bollard client construction does not require a live daemon");
        let executor = Arc::new(DeploymentExecutor::new(docker, (20000, 21000)));
        let spec = DeploymentSpec {
            model_ref: ModelRef::Local(PathBuf::from("/tmp/model")),
            inference_entrypoint: PathBuf::from("inference_script.py"),
            image_tag: "modeldeploy:latest".to_string(),
            credentials: ShellCredentials::new("placeholder", "deploy", ShellSecret::Password("x".into())),
        };
        DeploymentManager::new(clusters, executor, spec)
    }

    #[test]
    fn find_cluster_looks_up_by_id() {
        let mgr = manager(vec![cluster("a"), cluster("b")]);
        assert!(mgr.find_cluster("a").is_some());
        assert!(mgr.find_cluster("missing").is_none());
    }

    #[test]
    fn pick_cluster_round_robins_across_calls() {
        let mgr = manager(vec![cluster("a"), cluster("b"), cluster("c")]);
        let picks: Vec<&str> = (0..6)
            .map(|_| mgr.pick_cluster().unwrap().cluster_id.as_str())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn pick_cluster_on_empty_list_returns_none() {
        let mgr = manager(vec![]);
        assert!(mgr.pick_cluster().is_none());
    }

    #[tokio::test]
    async fn current_replica_count_starts_at_zero() {
        let mgr = manager(vec![cluster("a")]);
        assert_eq!(mgr.current_replica_count().await, 0);
        assert!(mgr.active_endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn register_replica_makes_it_visible_to_active_endpoints() {
        let mgr = manager(vec![cluster("gpu-east")]);
        let outcome = DeployOutcome {
            container_id: "abcdef012345678".to_string(),
            port_lease: deploy_core::model::PortLease {
                local_port: 20010,
                remote_port: 20011,
            },
            tunnel: None,
        };

        let record = mgr.register_replica("gpu-east", "gpu-east.internal", &outcome).await;

        assert_eq!(record.cluster_ref, "gpu-east");
        assert_eq!(record.endpoint, "gpu-east.internal:20011");
        assert_eq!(mgr.current_replica_count().await, 1);
        let active = mgr.active_endpoints().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].instance_id, record.instance_id);
    }
}
