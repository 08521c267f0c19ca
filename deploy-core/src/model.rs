//! Shared data types for the deployment path (C1–C5).
//!
//! Sum types here replace the dynamic-dispatch-by-convention idioms of the
//! original implementation: [`ShellCredentials`] enforces the "password XOR
//! key" invariant at construction instead of at use, and [`ModelRef`]
//! replaces "sometimes a path, sometimes a URL" string sniffing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// What [`HostProfiler`](crate::profiler) learned about a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRecord {
    pub os_family: OsFamily,
    pub kernel_name: String,
    pub machine_arch: String,
    pub cpu_count: u32,
    pub memory_total_gb: u32,
    pub gpu_count: u32,
    pub gpu_info: Vec<String>,
    pub free_disk_gb: u64,
}

impl ProfileRecord {
    /// The `{kernel}/{arch}` string passed to the container builder's
    /// `--platform` flag. macOS hosts always build for `linux` — containers
    /// never run the Darwin kernel.
    pub fn container_platform(&self) -> String {
        let kernel = if self.kernel_name.eq_ignore_ascii_case("darwin") {
            "linux".to_string()
        } else {
            self.kernel_name.to_lowercase()
        };
        format!("{kernel}/{}", self.machine_arch)
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
}

/// Authentication material for [`crate::shell::RemoteShell`]. Exactly one of
/// password or private-key auth is held — there is no representable invalid
/// state, unlike a `{password: Option<String>, key_path: Option<PathBuf>}`
/// pair that a caller could populate both or neither of.
#[derive(Debug, Clone)]
pub struct ShellCredentials {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub secret: ShellSecret,
}

#[derive(Debug, Clone)]
pub enum ShellSecret {
    Password(String),
    KeyPath(PathBuf),
}

impl ShellCredentials {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        secret: ShellSecret,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            secret,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Mirrors the source's validation step: construction from loosely-typed
    /// input (e.g. a deserialized request body) must reject both-set and
    /// neither-set, since `ShellSecret` itself cannot represent them.
    pub fn from_parts(
        hostname: String,
        port: Option<u16>,
        username: String,
        password: Option<String>,
        key_path: Option<PathBuf>,
    ) -> Result<Self, ConfigurationError> {
        let secret = match (password, key_path) {
            (Some(p), None) => ShellSecret::Password(p),
            (None, Some(k)) => ShellSecret::KeyPath(k),
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::InvalidCredentials(
                    "exactly one of password or key_path must be set, got both".into(),
                ))
            }
            (None, None) => {
                return Err(ConfigurationError::InvalidCredentials(
                    "exactly one of password or key_path must be set, got neither".into(),
                ))
            }
        };
        Ok(Self {
            hostname,
            port: port.unwrap_or(22),
            username,
            secret,
        })
    }
}

/// Either a local filesystem path or a reference into a hosted model
/// repository. Replaces the original's single `model_ref` string plus an
/// `is_hf` boolean flag with one parser at the boundary.
#[derive(Debug, Clone)]
pub enum ModelRef {
    Local(PathBuf),
    Hosted { repo_id: String, token: Option<String> },
}

impl ModelRef {
    pub fn is_hosted(&self) -> bool {
        matches!(self, ModelRef::Hosted { .. })
    }
}

/// Immutable once issued — cloned into each [`crate::deploy`] invocation and
/// into the resulting `ReplicaRecord`.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub model_ref: ModelRef,
    pub inference_entrypoint: PathBuf,
    pub image_tag: String,
    pub credentials: ShellCredentials,
}

/// A JSON wire form of [`DeploymentSpec`] accepted by `POST /deploy`. Kept
/// separate from `DeploymentSpec` because the wire shape mirrors the
/// original's flat `{model_ref, is_hf, hosted_token}` fields while the
/// in-process type carries the parsed sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpecRequest {
    pub model_ref: String,
    pub inference_entrypoint: PathBuf,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    pub is_hosted_ref: bool,
    pub hosted_token: Option<String>,
    pub cluster_id: String,
}

fn default_image_tag() -> String {
    "modeldeploy:latest".to_string()
}

/// A single running replica, exclusively owned by
/// [`fleet_control::manager::DeploymentManager`] (the `fleet-control` crate
/// depends on this crate, not the other way around, so the owner type lives
/// there; this module only defines the record shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub instance_id: String,
    pub container_id: String,
    pub cluster_ref: String,
    pub endpoint: String,
    pub status: ReplicaStatus,
    pub created_at: u64,
}

impl ReplicaRecord {
    /// `instance_id = cluster_id ⊕ container_id[:12]`.
    pub fn make_instance_id(cluster_id: &str, container_id: &str) -> String {
        let short = &container_id[..container_id.len().min(12)];
        format!("{cluster_id}-{short}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Starting,
    Running,
    Stopping,
    Dead,
}

/// Loaded once from operator configuration, read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub cluster_id: String,
    pub hostname: String,
    pub username: String,
    pub key_path: PathBuf,
}

impl ClusterDescriptor {
    pub fn credentials(&self) -> ShellCredentials {
        ShellCredentials::new(
            self.hostname.clone(),
            self.username.clone(),
            ShellSecret::KeyPath(self.key_path.clone()),
        )
    }
}

/// Produced by the Port Allocator per deployment; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub local_port: u16,
    pub remote_port: u16,
}

/// Which orchestration step a [`crate::error::DeployError`] failed in —
/// lets callers name the failing stage without string-matching an error
/// message (spec's tagged-result redesign).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    PreFlight,
    ProfileRemote,
    AllocatePorts,
    Package,
    Transfer,
    Load,
    Run,
    Tunnel,
    Prune,
    Finalize,
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployStage::PreFlight => "pre_flight",
            DeployStage::ProfileRemote => "profile_remote",
            DeployStage::AllocatePorts => "allocate_ports",
            DeployStage::Package => "package",
            DeployStage::Transfer => "transfer",
            DeployStage::Load => "load",
            DeployStage::Run => "run",
            DeployStage::Tunnel => "tunnel",
            DeployStage::Prune => "prune",
            DeployStage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_credentials_reject_both_password_and_key() {
        let err = ShellCredentials::from_parts(
            "host".into(),
            None,
            "user".into(),
            Some("hunter2".into()),
            Some(PathBuf::from("/home/user/.ssh/id_ed25519")),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidCredentials(_)));
    }

    #[test]
    fn shell_credentials_reject_neither_password_nor_key() {
        let err = ShellCredentials::from_parts("host".into(), None, "user".into(), None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidCredentials(_)));
    }

    #[test]
    fn shell_credentials_accept_exactly_one_secret() {
        let creds = ShellCredentials::from_parts(
            "host".into(),
            Some(2222),
            "user".into(),
            Some("hunter2".into()),
            None,
        )
        .unwrap();
        assert_eq!(creds.port, 2222);
        assert!(matches!(creds.secret, ShellSecret::Password(ref p) if p == "hunter2"));
    }

    #[test]
    fn instance_id_combines_cluster_and_short_container_id() {
        let id = ReplicaRecord::make_instance_id("cluster-a", "abcdef0123456789");
        assert_eq!(id, "cluster-a-abcdef012345");
    }

    #[test]
    fn instance_id_tolerates_short_container_ids() {
        let id = ReplicaRecord::make_instance_id("cluster-a", "ab01");
        assert_eq!(id, "cluster-a-ab01");
    }

    #[test]
    fn deploy_stage_display_matches_snake_case_wire_form() {
        assert_eq!(DeployStage::AllocatePorts.to_string(), "allocate_ports");
        assert_eq!(DeployStage::Finalize.to_string(), "finalize");
    }
}
