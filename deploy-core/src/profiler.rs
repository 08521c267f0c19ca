//! Host Profiler (C1): probes a host for kernel, architecture, CPU/memory,
//! GPU presence, and free disk, emitting a [`ProfileRecord`].
//!
//! Grounded in `original_source/core/model_deployer/profiler/profiler.py`'s
//! shell-command table keyed by OS family, and in the teacher's
//! `host_port_mapping::is_docker_desktop`-style platform probing.

use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;
use crate::model::{OsFamily, ProfileRecord};
use crate::shell::Shell;

const PROFILE_FILE_NAME: &str = "modeldeploy_profile.json";

pub struct HostProfiler;

impl HostProfiler {
    /// Profiles the host reachable through `shell`. Pass a
    /// [`crate::shell::LocalShell`] to profile the operator's own host.
    pub async fn profile(shell: &dyn Shell) -> Result<ProfileRecord, ConfigurationError> {
        let kernel_raw = Self::run_trim(shell, "uname -s").await?;
        let os_family = Self::infer_os_family(&kernel_raw, shell).await?;

        let machine_arch = Self::run_trim(shell, "uname -m").await.unwrap_or_default();
        let cpu_count = Self::probe_cpu_count(shell).await;
        let memory_total_gb = Self::probe_memory_gb(shell).await;
        let (gpu_count, gpu_info) = Self::probe_gpus(shell).await;
        let free_disk_gb = Self::probe_free_disk_gb(shell).await;

        Ok(ProfileRecord {
            os_family,
            kernel_name: kernel_raw,
            machine_arch,
            cpu_count,
            memory_total_gb,
            gpu_count,
            gpu_info,
            free_disk_gb,
        })
    }

    async fn infer_os_family(
        kernel_raw: &str,
        shell: &dyn Shell,
    ) -> Result<OsFamily, ConfigurationError> {
        match kernel_raw {
            "Darwin" => Ok(OsFamily::MacOs),
            "Linux" => Ok(OsFamily::Linux),
            "" => {
                // `uname` itself is absent: attempt a Windows system-info probe.
                if shell.exec("systeminfo").await.map(|o| o.success()).unwrap_or(false) {
                    Ok(OsFamily::Windows)
                } else {
                    Err(ConfigurationError::UnknownOsFamily(
                        "host answered neither uname nor systeminfo".into(),
                    ))
                }
            }
            other => Err(ConfigurationError::UnknownOsFamily(other.to_string())),
        }
    }

    async fn run_trim(shell: &dyn Shell, cmd: &str) -> Result<String, ConfigurationError> {
        let out = shell
            .exec(cmd)
            .await
            .map_err(|e| ConfigurationError::UnknownOsFamily(e.to_string()))?;
        Ok(out.stdout.trim().to_string())
    }

    async fn probe_cpu_count(shell: &dyn Shell) -> u32 {
        let cmd = "nproc 2>/dev/null || sysctl -n hw.ncpu 2>/dev/null";
        shell
            .exec(cmd)
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse().ok())
            .unwrap_or(1)
    }

    async fn probe_memory_gb(shell: &dyn Shell) -> u32 {
        let cmd = "awk '/MemTotal/{print int($2/1024/1024)}' /proc/meminfo 2>/dev/null \
                   || echo $(( $(sysctl -n hw.memsize 2>/dev/null || echo 0) / 1073741824 ))";
        shell
            .exec(cmd)
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse().ok())
            .unwrap_or(0)
    }

    async fn probe_gpus(shell: &dyn Shell) -> (u32, Vec<String>) {
        let cmd = "nvidia-smi --query-gpu=name --format=csv,noheader 2>/dev/null";
        match shell.exec(cmd).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                let names: Vec<String> = out
                    .stdout
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
                (names.len() as u32, names)
            }
            _ => (0, Vec::new()),
        }
    }

    async fn probe_free_disk_gb(shell: &dyn Shell) -> u64 {
        let cmd = "df -Pk / | awk 'NR==2{print int($4/1024/1024)}'";
        shell
            .exec(cmd)
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Verifies the tool-presence precondition for §4.1: on the operator
    /// host, requires a container builder and file-sync tool; on remote,
    /// requires a container runtime and a privileged-execute tool. Returns
    /// the names of missing tools so the caller (C5 pre-flight) can attempt
    /// installation — this is a recoverable condition, not an error.
    pub async fn missing_tools(shell: &dyn Shell, tools: &[&str]) -> Vec<String> {
        let mut missing = Vec::new();
        for tool in tools {
            let present = shell
                .exec(&format!("command -v {tool}"))
                .await
                .map(|o| o.success() && !o.stdout.trim().is_empty())
                .unwrap_or(false);
            if !present {
                missing.push(tool.to_string());
            }
        }
        missing
    }

    /// Persists the profile to a small JSON document under the operator's
    /// home directory, overwritten on each deploy. Uses `etcetera` the same
    /// way the teacher pulls in platform-appropriate directories, rather
    /// than hand-rolling `$HOME` resolution.
    pub fn persist(profile: &ProfileRecord) -> Result<PathBuf, ConfigurationError> {
        let path = Self::profile_path()?;
        let json = serde_json::to_string_pretty(profile).map_err(|e| {
            ConfigurationError::Io {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }
        })?;
        std::fs::write(&path, json).map_err(|source| ConfigurationError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load_persisted() -> Result<ProfileRecord, ConfigurationError> {
        let path = Self::profile_path()?;
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigurationError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|e| ConfigurationError::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    fn profile_path() -> Result<PathBuf, ConfigurationError> {
        let base = etcetera::home_dir().map_err(|_| {
            ConfigurationError::MissingField("operator home directory could not be resolved")
        })?;
        Ok(Path::new(&base).join(PROFILE_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_platform_normalizes_darwin_to_linux() {
        let profile = ProfileRecord {
            os_family: OsFamily::MacOs,
            kernel_name: "Darwin".to_string(),
            machine_arch: "arm64".to_string(),
            cpu_count: 8,
            memory_total_gb: 16,
            gpu_count: 0,
            gpu_info: vec![],
            free_disk_gb: 100,
        };
        assert_eq!(profile.container_platform(), "linux/arm64");
    }

    #[test]
    fn container_platform_preserves_linux_kernel() {
        let profile = ProfileRecord {
            os_family: OsFamily::Linux,
            kernel_name: "Linux".to_string(),
            machine_arch: "x86_64".to_string(),
            cpu_count: 4,
            memory_total_gb: 8,
            gpu_count: 1,
            gpu_info: vec!["NVIDIA A100".to_string()],
            free_disk_gb: 200,
        };
        assert_eq!(profile.container_platform(), "linux/x86_64");
        assert!(profile.has_gpu());
    }
}
