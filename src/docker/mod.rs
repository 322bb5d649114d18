//! The engine client seam. mobycron consumes Docker as a capability set so
//! the registry and reconciler can be exercised against a recording mock.

#[cfg(test)]
pub mod mock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, RestartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::CreateExecOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, ServiceSpec};
use bollard::service::{ListServicesOptions, UpdateServiceOptions};
use bollard::system::EventsOptions;
use futures::stream::{StreamExt, TryStreamExt};
use futures::Stream;
use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::Pin;
use tracing::debug;

pub type Filters = HashMap<String, Vec<String>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventMessage>> + Send>>;
pub type ExecOutputStream = Pin<Box<dyn Stream<Item = Result<LogOutput>> + Send>>;

/// The capability set mobycron needs from the engine. Implemented for the
/// real client below; tests substitute [`mock::MockDockerClient`].
#[async_trait]
pub trait DockerClient: Debug + Send + Sync {
    async fn list_containers(&self, filters: Filters) -> Result<Vec<ContainerSummary>>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// `timeout` is the engine's graceful-shutdown budget in seconds.
    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout: i64) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse>;

    /// Create an exec instance attached to stdout+stderr; returns its id.
    async fn create_exec(&self, id: &str, cmd: Vec<String>) -> Result<String>;

    /// Start the exec instance and return its demultiplexed output stream.
    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutputStream>;

    /// Exit code of a finished exec instance.
    async fn inspect_exec(&self, exec_id: &str) -> Result<i64>;

    async fn list_services(&self, filters: Filters) -> Result<Vec<bollard::models::Service>>;

    /// Force a service update at `version`; returns any engine warnings.
    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: ServiceSpec,
    ) -> Result<Vec<String>>;

    /// Subscribe to engine events matching `filters`. Dropping the stream
    /// cancels the subscription.
    fn events(&self, filters: Filters) -> EventStream;
}

/// The real engine client, backed by bollard over the local socket.
#[derive(Debug)]
pub struct Docker {
    client: bollard::Docker,
}

impl Docker {
    /// Connect and probe the engine so an unreachable daemon fails startup
    /// rather than the first scheduled job.
    pub async fn new() -> Result<Self> {
        let client = bollard::Docker::connect_with_socket_defaults()
            .context("could not connect to the docker daemon")?;

        let version = client
            .version()
            .await
            .context("could not reach the docker daemon; make sure it is installed and running")?;

        let engine_version = version.version.unwrap_or_default();
        debug!(version = %engine_version, "connected to docker engine");

        Ok(Self { client })
    }
}

#[async_trait]
impl DockerClient for Docker {
    async fn list_containers(&self, filters: Filters) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client.start_container::<String>(id, None).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        self.client
            .stop_container(id, Some(StopContainerOptions { t: timeout }))
            .await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str, timeout: i64) -> Result<()> {
        self.client
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: timeout as isize,
                }),
            )
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        let container = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(container)
    }

    async fn create_exec(&self, id: &str, cmd: Vec<String>) -> Result<String> {
        let created = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutputStream> {
        match self.client.start_exec(exec_id, None).await? {
            bollard::exec::StartExecResults::Attached { output, .. } => {
                Ok(Box::pin(output.map_err(anyhow::Error::from)))
            }
            bollard::exec::StartExecResults::Detached => Ok(Box::pin(futures::stream::empty())),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<i64> {
        let inspect = self.client.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code.unwrap_or_default())
    }

    async fn list_services(&self, filters: Filters) -> Result<Vec<bollard::models::Service>> {
        let services = self
            .client
            .list_services(Some(ListServicesOptions {
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(services)
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: ServiceSpec,
    ) -> Result<Vec<String>> {
        let response = self
            .client
            .update_service(
                id,
                spec,
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await?;
        Ok(response.warnings.unwrap_or_default())
    }

    fn events(&self, filters: Filters) -> EventStream {
        let events = self.client.events(Some(EventsOptions {
            filters,
            ..Default::default()
        }));
        Box::pin(events.map(|item| item.map_err(anyhow::Error::from)))
    }
}
