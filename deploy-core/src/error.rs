//! Error taxonomy for the deployment path, modeled on
//! `TestcontainersError`/`ClientError` in the teacher: one top-level enum
//! per crate, composed via `#[from]`, with a `stage` field carried alongside
//! rather than encoded into the message.

use crate::model::DeployStage;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown OS family reported by host probe: {0}")]
    UnknownOsFamily(String),
    #[error("unknown cluster_id: {0}")]
    UnknownCluster(String),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("ssh authentication rejected for {username}@{hostname}")]
    AuthFailure { hostname: String, username: String },
    #[error("ssh transport error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key error: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("io error talking to remote host: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote command exited non-zero: {command} (exit {exit_code:?})")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("docker build failed for {image_tag}: {source}")]
    Docker {
        image_tag: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("failed to assemble build context: {0}")]
    Context(std::io::Error),
    #[error("failed to export image {image_tag} to tarball: {source}")]
    Export {
        image_tag: String,
        #[source]
        source: bollard::errors::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to load image tarball {remote_tar_path} on remote: {0}")]
    Remote {
        remote_tar_path: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start container for image {image_tag}: {0}")]
    Start {
        image_tag: String,
        #[source]
        source: TransportError,
    },
    #[error("remote reported no container id after run")]
    NoContainerId,
}

#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    #[error("no free port found in range [{start}, {end}] on {where_}")]
    NoFreePort {
        where_: &'static str,
        start: u16,
        end: u16,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("inference request failed: {0}")]
    Http(String),
    #[error("no active replica endpoints available")]
    NoEndpoints,
}

/// Top-level error for the deploy path. Every variant that can occur inside
/// a specific orchestration step additionally carries that step via
/// [`DeployError::stage`], matching the spec's "tagged result type" redesign
/// note so callers never need to pattern-match on message text.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("[{stage}] configuration error: {source}")]
    Configuration {
        stage: DeployStage,
        #[source]
        source: ConfigurationError,
    },
    #[error("[{stage}] hosted model unavailable: {reason}")]
    HostedModelUnavailable { stage: DeployStage, reason: String },
    #[error("[{stage}] transport error: {source}")]
    Transport {
        stage: DeployStage,
        #[source]
        source: TransportError,
    },
    #[error("[{stage}] build error: {source}")]
    Build {
        stage: DeployStage,
        #[source]
        source: BuildError,
    },
    #[error("[{stage}] load error: {source}")]
    Load {
        stage: DeployStage,
        #[source]
        source: LoadError,
    },
    #[error("[{stage}] run error: {source}")]
    Run {
        stage: DeployStage,
        #[source]
        source: RunError,
    },
    #[error("[{stage}] capacity error: {source}")]
    Capacity {
        stage: DeployStage,
        #[source]
        source: CapacityError,
    },
    #[error("[{stage}] fatal internal error: {0}")]
    FatalInternal(DeployStage, String),
}

impl DeployError {
    pub fn stage(&self) -> DeployStage {
        match self {
            DeployError::Configuration { stage, .. }
            | DeployError::HostedModelUnavailable { stage, .. }
            | DeployError::Transport { stage, .. }
            | DeployError::Build { stage, .. }
            | DeployError::Load { stage, .. }
            | DeployError::Run { stage, .. }
            | DeployError::Capacity { stage, .. }
            | DeployError::FatalInternal(stage, _) => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_accessor_names_the_failing_step_without_string_matching() {
        let err = DeployError::HostedModelUnavailable {
            stage: DeployStage::Package,
            reason: "private model, no token".to_string(),
        };
        assert_eq!(err.stage(), DeployStage::Package);
        assert!(err.to_string().contains("package"));
    }

    #[test]
    fn capacity_error_display_includes_the_probed_range() {
        let err = CapacityError::NoFreePort {
            where_: "remote",
            start: 20000,
            end: 20010,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("20000"));
        assert!(rendered.contains("20010"));
        assert!(rendered.contains("remote"));
    }
}
