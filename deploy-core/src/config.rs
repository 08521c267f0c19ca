//! Operator configuration loading, modeled on the teacher's
//! `core::env::Config::load` (file + environment, with defaults).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::model::ClusterDescriptor;

pub const DEFAULT_CONFIG_PATH: &str = "modeldeploy.toml";

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    RoundRobin,
    Random,
    LeastConnections,
}

impl Default for LbStrategy {
    fn default() -> Self {
        LbStrategy::RoundRobin
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

fn default_min_replicas() -> usize {
    1
}
fn default_max_replicas() -> usize {
    10
}
fn default_scale_up_threshold() -> f64 {
    5.0
}
fn default_scale_down_threshold() -> f64 {
    2.0
}
fn default_cooldown_seconds() -> u64 {
    60
}
fn default_check_interval_seconds() -> u64 {
    10
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueBackendConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterDescriptor>,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub lb_strategy: LbStrategy,
    pub queue_backend: Option<QueueBackendConfig>,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
}

fn default_port_range_start() -> u16 {
    20000
}
fn default_port_range_end() -> u16 {
    30000
}

impl OperatorConfig {
    /// Loads from `path`, falling back to defaults for every field when the
    /// file is absent entirely (mirrors the teacher's `Config::load`
    /// tolerating a missing `DOCKER_CONFIG_FILE`). A present-but-malformed
    /// file is a hard [`ConfigurationError`].
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OperatorConfig {
                    clusters: Vec::new(),
                    autoscaler: AutoscalerConfig::default(),
                    lb_strategy: LbStrategy::default(),
                    queue_backend: None,
                    port_range_start: default_port_range_start(),
                    port_range_end: default_port_range_end(),
                })
            }
            Err(source) => {
                return Err(ConfigurationError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: OperatorConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("modeldeploy_nonexistent_config.toml");
        let _ = std::fs::remove_file(&path);

        let config = OperatorConfig::load(&path).unwrap();
        assert!(config.clusters.is_empty());
        assert_eq!(config.autoscaler.min_replicas, 1);
        assert_eq!(config.port_range_start, 20000);
        assert!(matches!(config.lb_strategy, LbStrategy::RoundRobin));
    }

    #[test]
    fn load_parses_clusters_and_overrides() {
        let path = std::env::temp_dir().join("modeldeploy_test_config.toml");
        std::fs::write(
            &path,
            r#"
            lb_strategy = "least_connections"
            port_range_start = 21000
            port_range_end = 21100

            [autoscaler]
            min_replicas = 2
            max_replicas = 8

            [[clusters]]
            cluster_id = "gpu-east"
            hostname = "gpu-east.internal"
            username = "deploy"
            key_path = "/home/deploy/.ssh/id_ed25519"
            "#,
        )
        .unwrap();

        let config = OperatorConfig::load(&path).unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].cluster_id, "gpu-east");
        assert_eq!(config.autoscaler.min_replicas, 2);
        assert_eq!(config.autoscaler.max_replicas, 8);
        assert!(matches!(config.lb_strategy, LbStrategy::LeastConnections));
        assert_eq!(config.port_range_start, 21000);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let path = std::env::temp_dir().join("modeldeploy_bad_config.toml");
        std::fs::write(&path, "this is not valid toml = [[[").unwrap();

        let err = OperatorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse(_)));

        std::fs::remove_file(&path).ok();
    }
}
