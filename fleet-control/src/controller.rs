//! Fleet Controller: the explicit aggregate value named in the redesign
//! notes (spec §9) in place of the original's module-level globals
//! (`deployment_manager`, `load_balancer`, `request_queue` at the top of
//! `request_api.py`). Constructed once at process start and passed by
//! reference into HTTP handlers and background tasks.

use std::sync::Arc;

use deploy_core::config::OperatorConfig;
use deploy_core::{ClusterDescriptor, DeploymentExecutor, DeploymentSpec};
use tokio_util::sync::CancellationToken;

use crate::autoscaler::Autoscaler;
use crate::balancer::LoadBalancer;
use crate::dispatcher::Dispatcher;
use crate::manager::DeploymentManager;
use crate::queue::RequestQueue;

pub struct FleetController {
    pub queue: Arc<RequestQueue>,
    pub manager: Arc<DeploymentManager>,
    pub balancer: Arc<LoadBalancer>,
    pub autoscaler: Arc<Autoscaler>,
    pub config: OperatorConfig,
}

impl FleetController {
    pub fn new(
        config: OperatorConfig,
        clusters: Vec<ClusterDescriptor>,
        executor: Arc<DeploymentExecutor>,
        spec: DeploymentSpec,
    ) -> Self {
        let queue = Arc::new(RequestQueue::default());
        let manager = Arc::new(DeploymentManager::new(clusters, executor, spec));
        let balancer = Arc::new(LoadBalancer::new(config.lb_strategy));
        let autoscaler = Arc::new(Autoscaler::new(
            config.autoscaler.clone(),
            queue.clone(),
            manager.clone(),
        ));

        Self {
            queue,
            manager,
            balancer,
            autoscaler,
            config,
        }
    }

    /// Spawns the background dispatcher workers and the autoscaler loop.
    /// Both stop cooperatively when `cancel` fires, matching spec §5's
    /// shutdown contract.
    pub fn spawn_background_tasks(&self, worker_count: usize, cancel: CancellationToken) {
        for _ in 0..worker_count {
            let dispatcher = Arc::new(Dispatcher::new(
                self.queue.clone(),
                self.balancer.clone(),
                self.manager.clone(),
            ));
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await });
        }

        let autoscaler = self.autoscaler.clone();
        tokio::spawn(async move { autoscaler.run(cancel).await });
    }
}
