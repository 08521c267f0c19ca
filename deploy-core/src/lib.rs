//! Host profiling, port allocation, remote shell, image packaging, and
//! deployment execution — the Deployer half of the model deployment engine
//! (C1–C5).

pub mod config;
pub mod deploy;
pub mod error;
pub mod image;
pub mod model;
pub mod ports;
pub mod profiler;
pub mod shell;

pub use deploy::{DeployOptions, DeployOutcome, DeploymentExecutor};
pub use error::DeployError;
pub use model::{
    ClusterDescriptor, DeployStage, DeploymentSpec, DeploymentSpecRequest, ModelRef, PortLease,
    ProfileRecord, ReplicaRecord, ReplicaStatus, ShellCredentials, ShellSecret,
};
