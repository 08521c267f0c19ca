//! Command-line entrypoint (C15): `deploy`, `serve`, `profile` subcommands.
//! Grounded in the `clap::Parser` derive style used throughout the example
//! pack (e.g. hydroflow's `chat` example) and in the axum graceful-shutdown
//! pattern of `testimages/simple_web_server/src/main.rs`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use control_api::{router, AppState};
use deploy_core::config::OperatorConfig;
use deploy_core::model::{DeploymentSpec, DeploymentSpecRequest, ModelRef};
use deploy_core::{DeployOptions, DeploymentExecutor};
use fleet_control::FleetController;

#[derive(Parser, Debug)]
#[command(name = "modeldeploy", about = "Model deployment and fleet control engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ten-step deployment sequence once against a single cluster.
    Deploy {
        #[arg(long)]
        spec: PathBuf,
        #[arg(long)]
        tunnel: bool,
        #[arg(long)]
        prune: bool,
    },
    /// Start the fleet controller's HTTP surface and background workers.
    Serve {
        #[arg(long, default_value = "modeldeploy.toml")]
        config: PathBuf,
        #[arg(long, default_value_t = 3)]
        workers: usize,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Profile the local host (or a remote one, given credentials).
    Profile {
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Deploy { spec, tunnel, prune } => run_deploy(spec, tunnel, prune).await,
        Command::Serve { config, workers, port } => run_serve(config, workers, port).await,
        Command::Profile { host } => run_profile(host).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_deploy(spec_path: PathBuf, tunnel: bool, prune: bool) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(&spec_path)?;
    let request: DeploymentSpecRequest = serde_json::from_str(&contents)?;

    let model_ref = if request.is_hosted_ref {
        ModelRef::Hosted {
            repo_id: request.model_ref.clone(),
            token: request.hosted_token.clone(),
        }
    } else {
        ModelRef::Local(PathBuf::from(&request.model_ref))
    };

    let config = OperatorConfig::load(&OperatorConfig::default_path())?;
    let cluster = config
        .clusters
        .iter()
        .find(|c| c.cluster_id == request.cluster_id)
        .ok_or_else(|| anyhow::anyhow!("unknown cluster_id: {}", request.cluster_id))?;

    let deployment_spec = DeploymentSpec {
        model_ref,
        inference_entrypoint: request.inference_entrypoint,
        image_tag: request.image_tag,
        credentials: cluster.credentials(),
    };

    let docker = bollard::Docker::connect_with_local_defaults()?;
    let executor = DeploymentExecutor::new(docker, (config.port_range_start, config.port_range_end));

    match executor
        .deploy(&deployment_spec, DeployOptions { tunnel, prune })
        .await
    {
        Ok(outcome) => {
            println!(
                "deployed container {} on port {}",
                outcome.container_id, outcome.port_lease.remote_port
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("deploy failed at stage {}: {e}", e.stage());
            Err(anyhow::anyhow!(e))
        }
    }
}

async fn run_serve(config_path: PathBuf, workers: usize, port: u16) -> anyhow::Result<()> {
    let config = OperatorConfig::load(&config_path)?;
    let clusters = config.clusters.clone();
    let docker = bollard::Docker::connect_with_local_defaults()?;
    let executor = Arc::new(DeploymentExecutor::new(
        docker,
        (config.port_range_start, config.port_range_end),
    ));

    // The controller needs a representative spec to reuse for each
    // autoscaler-driven replica; until `/deploy` has been called once there
    // is none, so we seed with an empty placeholder spec from the first
    // configured cluster and rely on operators calling `/deploy` (or
    // configuring `clusters` with a default model) before scaling up.
    let placeholder_spec = clusters.first().map(|cluster| DeploymentSpec {
        model_ref: ModelRef::Local(PathBuf::from(".")),
        inference_entrypoint: PathBuf::from("inference_script.py"),
        image_tag: "modeldeploy:latest".to_string(),
        credentials: cluster.credentials(),
    });

    let Some(spec) = placeholder_spec else {
        anyhow::bail!("no clusters configured; add at least one to modeldeploy.toml");
    };

    let controller = Arc::new(FleetController::new(config, clusters, executor, spec));

    let cancel = tokio_util::sync::CancellationToken::new();
    controller.spawn_background_tasks(workers, cancel.clone());

    let state = Arc::new(AppState { controller });
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("fleet controller listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    Ok(())
}

async fn shutdown_signal(cancel: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("signal received, starting graceful shutdown");
    cancel.cancel();
}

async fn run_profile(host: Option<String>) -> anyhow::Result<()> {
    use deploy_core::profiler::HostProfiler;
    use deploy_core::shell::LocalShell;

    let profile = match host {
        None => HostProfiler::profile(&LocalShell).await?,
        Some(_) => anyhow::bail!("remote profiling requires credentials; use the `serve`/`deploy` paths"),
    };

    println!("{}", serde_json::to_string_pretty(&profile)?);
    HostProfiler::persist(&profile)?;
    Ok(())
}
