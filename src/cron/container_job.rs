//! Lifecycle jobs against existing containers: start, restart, stop, or
//! exec a command inside one.

use crate::docker::DockerClient;
use crate::scheduler;
use anyhow::{bail, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use futures::StreamExt;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// A container lifecycle action run on a schedule. `service_id`, `slot`,
/// and `created` carry the swarm identity used for replacement; plain
/// containers leave the service fields empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerJob {
    pub schedule: String,
    pub action: String,
    /// Seconds granted for a graceful stop; empty means the 10s default.
    pub timeout: String,
    pub command: String,
    pub container_id: String,
    pub container_names: Vec<String>,
    pub service_id: String,
    pub slot: i64,
    pub created: i64,
}

impl ContainerJob {
    /// Index key: swarm jobs collapse onto their service slot so a task
    /// replacement lands on the same entry; plain containers stand alone.
    pub(crate) fn index_key(&self) -> String {
        if self.service_id.is_empty() {
            self.container_id.clone()
        } else {
            format!("{}.{}", self.service_id, self.slot)
        }
    }

    pub(crate) fn timeout_seconds(&self) -> i64 {
        if self.timeout.is_empty() {
            10
        } else {
            self.timeout.parse().unwrap_or(10)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ContainerAction {
    Start,
    Restart,
    Stop,
    Exec,
}

pub(crate) struct ContainerJobRunner {
    job: ContainerJob,
    action: ContainerAction,
    cli: Arc<dyn DockerClient>,
    sync: TaskTracker,
}

impl ContainerJobRunner {
    pub(crate) fn new(
        job: ContainerJob,
        action: ContainerAction,
        cli: Arc<dyn DockerClient>,
        sync: TaskTracker,
    ) -> Self {
        Self {
            job,
            action,
            cli,
            sync,
        }
    }

    async fn execute(&self, output: &mut String) -> Result<()> {
        let id = &self.job.container_id;
        match self.action {
            ContainerAction::Start => self.cli.start_container(id).await,
            ContainerAction::Restart => {
                self.cli
                    .restart_container(id, self.job.timeout_seconds())
                    .await
            }
            ContainerAction::Stop => self.cli.stop_container(id, self.job.timeout_seconds()).await,
            ContainerAction::Exec => self.exec(output).await,
        }
    }

    async fn exec(&self, output: &mut String) -> Result<()> {
        let id = &self.job.container_id;
        let cmd: Vec<String> = self
            .job
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect();

        // Inspect before creating the exec instance: a missing container
        // must fail here, otherwise we leak exec ids on the engine, and
        // "no such container" errors should take precedence anyway.
        self.cli.inspect_container(id).await?;

        let exec_id = self.cli.create_exec(id, cmd).await?;
        if exec_id.is_empty() {
            bail!("exec ID empty");
        }

        let mut frames = self.cli.start_exec(&exec_id).await?;
        while let Some(frame) = frames.next().await {
            match frame? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        let exit_code = self.cli.inspect_exec(&exec_id).await?;
        if exit_code != 0 {
            bail!("exit status {exit_code}");
        }
        Ok(())
    }
}

#[async_trait]
impl scheduler::Job for ContainerJobRunner {
    async fn run(&self) {
        let _work = self.sync.token();

        let mut output = String::new();
        let result = self.execute(&mut output).await;
        match result {
            Ok(()) => info!(
                schedule = %self.job.schedule,
                action = %self.job.action,
                timeout = %self.job.timeout,
                command = %self.job.command,
                container_id = %self.job.container_id,
                container_names = %self.job.container_names.join(","),
                output = %output,
                "container action completed successfully"
            ),
            Err(e) => error!(
                schedule = %self.job.schedule,
                action = %self.job.action,
                timeout = %self.job.timeout,
                command = %self.job.command,
                container_id = %self.job.container_id,
                container_names = %self.job.container_names.join(","),
                output = %output,
                error = %format!("{e:#}"),
                "container job completed with error"
            ),
        }
    }
}
