//! Flag parsing and process wiring: build the registry and reconciler for
//! the selected docker mode, then run until a termination signal asks for
//! a graceful drain.

use crate::cron::{Cron, Handler};
use crate::docker::{self, DockerClient};
use crate::fs::OsFilesystem;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use strum::Display;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// mobycron is a cron job scheduler that lives next to a docker engine.
///
/// Jobs come from three places: shell commands declared in a JSON config
/// file, containers labeled with `mobycron.schedule`, and swarm services
/// carrying the same label. Container and service jobs follow the engine's
/// event stream, so creating, updating, or removing a labeled object keeps
/// the schedule in sync without restarting mobycron.
#[derive(Debug, Parser)]
#[command(name = "mobycron")]
#[command(version)]
pub struct Args {
    /// Which reconciler paths run against the engine.
    #[arg(long, value_enum, env = "MOBYCRON_DOCKER_MODE", default_value_t = DockerMode::None)]
    pub docker_mode: DockerMode,

    /// Parse cron expressions with a leading seconds field.
    #[arg(long, env = "MOBYCRON_PARSE_SECOND")]
    pub parse_second: bool,

    /// Path to a JSON array of file jobs.
    #[arg(long, env = "MOBYCRON_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum DockerMode {
    /// Schedule file jobs only; never touch the engine.
    None,
    /// Reconcile against labeled containers.
    Container,
    /// Reconcile against labeled swarm services.
    Swarm,
}

/// Line-delimited JSON on stdout. `RUST_LOG` overrides the default info
/// level; dependency targets that flood debug output stay off.
pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("bollard=off".parse().expect("Invalid directive"))
        .add_directive("hyper=off".parse().expect("Invalid directive"))
        .add_directive(LevelFilter::INFO.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .init();

    Ok(())
}

pub async fn run(args: Args) -> Result<()> {
    let fs = Arc::new(OsFilesystem);

    let docker: Option<Arc<dyn DockerClient>> = match args.docker_mode {
        DockerMode::None => None,
        DockerMode::Container | DockerMode::Swarm => {
            Some(Arc::new(docker::Docker::new().await?))
        }
    };

    let cron = Arc::new(Cron::new(args.parse_second, docker.clone(), fs));

    if let Some(path) = &args.config_file {
        cron.load_config(path).await?;
    }

    if let Some(cli) = docker {
        let handler = Arc::new(Handler::new(cron.clone(), cli));
        match args.docker_mode {
            DockerMode::Container => {
                handler
                    .scan_containers()
                    .await
                    .context("failed to scan containers")?;
                tokio::spawn(async move { handler.listen_containers().await });
            }
            DockerMode::Swarm => {
                handler
                    .scan_services()
                    .await
                    .context("failed to scan services")?;
                tokio::spawn(async move { handler.listen_services().await });
            }
            DockerMode::None => {}
        }
    }

    cron.start();

    wait_for_termination().await?;
    cron.stop().await;
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_termination() -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("could not install the SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("could not install the SIGTERM handler")?;

    tokio::select! {
        _ = interrupt.recv() => info!(signal = "SIGINT", "termination signal received"),
        _ = terminate.recv() => info!(signal = "SIGTERM", "termination signal received"),
    }
    Ok(())
}
