//! Deployment Executor (C5): orchestrates C1–C4. Grounded in the ten-step
//! sequence of `original_source/.../deployer.py::deploy_model` and in the
//! container-run configuration assembly of the teacher's
//! `runners::async_runner::AsyncRunner::start`.

use bollard::container::RemoveContainerOptions;
use bollard::Docker;

use crate::error::{BuildError, CapacityError, DeployError, LoadError, RunError, TransportError};
use crate::image::ImagePackager;
use crate::model::{DeployStage, DeploymentSpec, ModelRef, PortLease};
use crate::ports::PortAllocator;
use crate::profiler::HostProfiler;
use crate::shell::{RemoteShell, Shell, TunnelHandle};

const REMOTE_TOOLS: &[&str] = &["docker", "rsync"];
const OPERATOR_TOOLS: &[&str] = &["docker"];
const PRUNE_MAX_ATTEMPTS: u32 = 10;
const PRUNE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Options for a single C5 invocation, distinct from [`DeploymentSpec`]
/// because they control orchestration behavior rather than describe the
/// thing being deployed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    pub tunnel: bool,
    pub prune: bool,
}

/// What a successful C5 run reports back to its caller — enough for
/// [`crate::model::ReplicaRecord`] construction, and the tunnel handle if
/// one was requested.
pub struct DeployOutcome {
    pub container_id: String,
    pub port_lease: PortLease,
    pub tunnel: Option<TunnelHandle>,
}

pub struct DeploymentExecutor {
    docker: Docker,
    port_range: (u16, u16),
}

impl DeploymentExecutor {
    pub fn new(docker: Docker, port_range: (u16, u16)) -> Self {
        Self { docker, port_range }
    }

    /// Runs the full ten-step sequence. Step 10 (finalize) always runs,
    /// success or failure, matching the `finally` block in the source.
    pub async fn deploy(
        &self,
        spec: &DeploymentSpec,
        options: DeployOptions,
    ) -> Result<DeployOutcome, DeployError> {
        let shell = RemoteShell::connect(&spec.credentials)
            .await
            .map_err(|source| DeployError::Transport {
                stage: DeployStage::PreFlight,
                source,
            })?;

        let result = self.deploy_inner(spec, options, &shell).await;

        // Step 10: Finalize — runs on every exit path. `establish_tunnel`
        // forwards over a clone of this same SSH session, so disconnecting
        // here would tear down a tunnel's forwarding channels along with it
        // (`disconnect` ends the session for every clone of the handle, not
        // just this one). Leave the session open whenever a tunnel came
        // back; it is closed later by `TunnelHandle::shutdown` instead.
        let remote_tar_path = remote_tar_path(&spec.image_tag);
        let _ = shell.exec(&format!("rm -f {remote_tar_path}")).await;
        let tunnel_live = matches!(&result, Ok(outcome) if outcome.tunnel.is_some());
        if !tunnel_live {
            let _ = shell.close().await;
        }

        result
    }

    async fn deploy_inner(
        &self,
        spec: &DeploymentSpec,
        options: DeployOptions,
        shell: &RemoteShell,
    ) -> Result<DeployOutcome, DeployError> {
        // Step 1: Pre-flight — operator-host tooling.
        let local_missing = HostProfiler::missing_tools(&crate::shell::LocalShell, OPERATOR_TOOLS).await;
        if !local_missing.is_empty() {
            install_operator_tools(&local_missing).await.map_err(|source| {
                DeployError::Transport {
                    stage: DeployStage::PreFlight,
                    source,
                }
            })?;
        }

        // Step 2: Profile & verify remote.
        let profile = HostProfiler::profile(shell).await.map_err(|source| {
            DeployError::Configuration {
                stage: DeployStage::ProfileRemote,
                source,
            }
        })?;
        let remote_missing = HostProfiler::missing_tools(shell, REMOTE_TOOLS).await;
        if !remote_missing.is_empty() {
            install_remote_tools(shell, &remote_missing)
                .await
                .map_err(|source| DeployError::Transport {
                    stage: DeployStage::ProfileRemote,
                    source,
                })?;
        }
        log::info!(
            "profile_remote: gpu_count={} platform={}",
            profile.gpu_count,
            profile.container_platform()
        );

        // Early accessibility check for hosted models (C4), before any heavy work.
        if let ModelRef::Hosted { repo_id, token } = &spec.model_ref {
            ImagePackager::check_hosted_model_accessible(repo_id, token.as_deref())
                .await
                .map_err(|reason| DeployError::HostedModelUnavailable {
                    stage: DeployStage::Package,
                    reason,
                })?;
        }

        // Step 3: Allocate ports.
        let allocator = PortAllocator::new(self.port_range.0, self.port_range.1);
        let port_lease = allocator
            .allocate_pair(shell)
            .await
            .map_err(|source| DeployError::Capacity {
                stage: DeployStage::AllocatePorts,
                source,
            })?;

        // Step 4: Package.
        let context = ImagePackager::assemble(&spec.model_ref, &spec.inference_entrypoint, None)
            .map_err(|source| DeployError::Build {
                stage: DeployStage::Package,
                source,
            })?;
        let platform_string = profile.container_platform();
        let build_result = ImagePackager::build(&self.docker, &context, &spec.image_tag, &platform_string).await;
        let build_result = match build_result {
            Ok(tag) => Ok(tag),
            Err(source) => {
                ImagePackager::cleanup(context);
                return Err(DeployError::Build {
                    stage: DeployStage::Package,
                    source,
                });
            }
        };
        let image_tag = build_result?;
        let export_dir = std::env::current_dir().unwrap_or_else(|_| context.path().to_path_buf());
        let local_tar_path = ImagePackager::export(&self.docker, &image_tag, &export_dir)
            .await
            .map_err(|source| DeployError::Build {
                stage: DeployStage::Package,
                source,
            })?;
        ImagePackager::cleanup(context);

        // Step 5: Transfer.
        let remote_tar = remote_tar_path(&spec.image_tag);
        shell
            .upload(&local_tar_path, &remote_tar)
            .await
            .map_err(|source| DeployError::Transport {
                stage: DeployStage::Transfer,
                source,
            })?;
        let _ = tokio::fs::remove_file(&local_tar_path).await;

        // Step 6: Load.
        let load_output = shell
            .exec(&format!("sudo docker load -i {remote_tar}"))
            .await
            .map_err(|source| DeployError::Load {
                stage: DeployStage::Load,
                source: LoadError::Remote {
                    remote_tar_path: remote_tar.clone(),
                    source,
                },
            })?;
        if !load_output.success() {
            return Err(DeployError::Load {
                stage: DeployStage::Load,
                source: LoadError::Remote {
                    remote_tar_path: remote_tar.clone(),
                    source: TransportError::CommandFailed {
                        command: "docker load".into(),
                        exit_code: load_output.exit_code,
                        stderr: load_output.stderr,
                    },
                },
            });
        }

        // Step 7: Run.
        let container_id = self
            .run_remote_container(shell, spec, &profile, port_lease)
            .await?;

        // Step 8: Optionally tunnel.
        let tunnel = if options.tunnel {
            let handle = shell
                .establish_tunnel(port_lease.local_port, port_lease.remote_port)
                .await
                .map_err(|source| DeployError::Transport {
                    stage: DeployStage::Tunnel,
                    source,
                })?;
            println!("TUNNEL_PORT:{}", handle.local_port);
            Some(handle)
        } else {
            None
        };

        // Step 9: Optionally prune.
        if options.prune {
            self.prune(shell, &container_id, &spec.image_tag).await?;
        }

        Ok(DeployOutcome {
            container_id,
            port_lease,
            tunnel,
        })
    }

    async fn run_remote_container(
        &self,
        shell: &RemoteShell,
        spec: &DeploymentSpec,
        profile: &crate::model::ProfileRecord,
        port_lease: PortLease,
    ) -> Result<String, DeployError> {
        let mut cmd = vec!["sudo".to_string(), "docker".to_string(), "run".to_string()];
        if profile.has_gpu() {
            cmd.extend(["--gpus".to_string(), "all".to_string()]);
        }
        if let ModelRef::Hosted { token: Some(token), .. } = &spec.model_ref {
            cmd.extend(["-e".to_string(), format!("HF_TOKEN={token}")]);
        }
        cmd.extend([
            "-e".to_string(),
            format!("PORT={}", port_lease.remote_port),
            "-e".to_string(),
            "MODEL_DIR=/app/model".to_string(),
            "-d".to_string(),
            "-p".to_string(),
            format!("{0}:{0}", port_lease.remote_port),
            spec.image_tag.clone(),
        ]);

        let output = shell
            .exec(&cmd.join(" "))
            .await
            .map_err(|source| DeployError::Run {
                stage: DeployStage::Run,
                source: RunError::Start {
                    image_tag: spec.image_tag.clone(),
                    source,
                },
            })?;

        let container_id = output.stdout.trim().to_string();
        if !output.success() || container_id.is_empty() {
            return Err(DeployError::Run {
                stage: DeployStage::Run,
                source: RunError::NoContainerId,
            });
        }
        Ok(container_id)
    }

    /// Step 9: waits (bounded by a retry budget of ~10 probes at ~2s
    /// cadence) for the container to exit, then force-removes both
    /// container and image on the remote.
    async fn prune(
        &self,
        shell: &RemoteShell,
        container_id: &str,
        image_tag: &str,
    ) -> Result<(), DeployError> {
        let mut removed = false;
        for attempt in 0..PRUNE_MAX_ATTEMPTS {
            let check = shell
                .exec(&format!("sudo docker ps -a -q --filter id={container_id}"))
                .await
                .map_err(|source| DeployError::Transport {
                    stage: DeployStage::Prune,
                    source,
                })?;
            if check.stdout.trim().is_empty() {
                removed = true;
                break;
            }
            log::info!("prune: waiting for container to exit (attempt {attempt})");
            tokio::time::sleep(PRUNE_RETRY_DELAY).await;
        }
        if !removed {
            log::info!("prune: forcing removal of container {container_id}");
            let _ = shell.exec(&format!("sudo docker rm -f {container_id}")).await;
        }
        let remove_image = shell
            .exec(&format!("sudo docker rmi -f {image_tag}"))
            .await
            .map_err(|source| DeployError::Transport {
                stage: DeployStage::Prune,
                source,
            })?;
        if !remove_image.success() {
            log::warn!("prune: failed to remove image {image_tag}: {}", remove_image.stderr);
        }
        Ok(())
    }

    /// Convenience used by tests and by the dispatcher-free single-run CLI
    /// path: stops and force-removes a container by id locally through the
    /// Docker Engine API, without a remote shell. Not part of the §4.5
    /// sequence; used by `DeploymentManager::scale_down` analogues that
    /// already hold a `Docker` handle for the local daemon.
    pub async fn force_remove_local(&self, container_id: &str) -> Result<(), BuildError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|source| BuildError::Docker {
                image_tag: container_id.to_string(),
                source,
            })
    }
}

fn remote_tar_path(image_tag: &str) -> String {
    let base = image_tag.split(':').next().unwrap_or(image_tag);
    format!("{base}_remote.tar")
}

async fn install_operator_tools(missing: &[String]) -> Result<(), TransportError> {
    for tool in missing {
        log::warn!("operator host missing tool: {tool}");
        if tool == "docker" {
            if cfg!(target_os = "macos") {
                return Err(TransportError::CommandFailed {
                    command: "docker --version".into(),
                    exit_code: None,
                    stderr: "Docker Desktop must be installed manually on macOS".into(),
                });
            }
            let install = tokio::process::Command::new("sh")
                .arg("-c")
                .arg("curl -fsSL https://get.docker.com -o get-docker.sh && sudo sh get-docker.sh && rm get-docker.sh")
                .status()
                .await
                .map_err(TransportError::Io)?;
            if !install.success() {
                return Err(TransportError::CommandFailed {
                    command: "install docker".into(),
                    exit_code: install.code(),
                    stderr: String::new(),
                });
            }
        }
    }
    Ok(())
}

async fn install_remote_tools(shell: &dyn Shell, missing: &[String]) -> Result<(), TransportError> {
    for tool in missing {
        log::warn!("remote host missing tool: {tool}");
        let install_cmd = match tool.as_str() {
            "docker" => "curl -fsSL https://get.docker.com -o get-docker.sh && sudo sh get-docker.sh && rm get-docker.sh",
            "rsync" => "sudo apt-get update && sudo apt-get install -y rsync",
            _ => continue,
        };
        let out = shell.exec(install_cmd).await?;
        if !out.success() {
            log::warn!("attempted install of {tool} on remote exited non-zero: {}", out.stderr);
        }
    }
    Ok(())
}

