pub mod autoscaler;
pub mod balancer;
pub mod controller;
pub mod dispatcher;
pub mod manager;
pub mod queue;

pub use controller::FleetController;
pub use manager::DeploymentManager;
pub use queue::{QueuedRequest, RequestQueue};
