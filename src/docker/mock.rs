//! Hand-rolled recording mock for the engine client, used by registry,
//! executor, and reconciler tests.

use super::{DockerClient, EventStream, ExecOutputStream, Filters};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, ServiceSpec};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Script for one exec invocation.
#[derive(Debug, Default)]
pub struct ExecScript {
    pub exec_id: String,
    pub exit_code: i64,
    /// (is_stdout, payload) frames replayed through the attach stream.
    pub output: Vec<(bool, String)>,
}

#[derive(Debug, Default)]
pub struct MockDockerClient {
    pub containers: Mutex<Vec<ContainerSummary>>,
    pub services: Mutex<Vec<bollard::models::Service>>,
    /// Method name → error message returned instead of the scripted result.
    pub errors: Mutex<HashMap<&'static str, String>>,
    pub exec: Mutex<ExecScript>,
    /// Each element is one subscription's items; when exhausted,
    /// subscriptions stay pending forever.
    pub event_streams: Mutex<VecDeque<Vec<Result<EventMessage>>>>,
    pub update_warnings: Mutex<Vec<String>>,
    /// Every call in order, as "method:arg" strings.
    pub calls: Mutex<Vec<String>>,
}

impl MockDockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, method: &'static str, message: &str) {
        self.errors.lock().unwrap().insert(method, message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn error_for(&self, method: &'static str) -> Option<anyhow::Error> {
        self.errors.lock().unwrap().get(method).map(|m| anyhow!("{m}"))
    }
}

#[async_trait]
impl DockerClient for MockDockerClient {
    async fn list_containers(&self, filters: Filters) -> Result<Vec<ContainerSummary>> {
        self.record("list_containers".to_string());
        if let Some(err) = self.error_for("list_containers") {
            return Err(err);
        }

        let containers = self.containers.lock().unwrap().clone();
        Ok(match filters.get("id") {
            Some(ids) => containers
                .into_iter()
                .filter(|c| ids.contains(c.id.as_ref().unwrap_or(&String::new())))
                .collect(),
            None => containers,
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start_container:{id}"));
        match self.error_for("start_container") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        self.record(format!("stop_container:{id}:{timeout}"));
        match self.error_for("stop_container") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn restart_container(&self, id: &str, timeout: i64) -> Result<()> {
        self.record(format!("restart_container:{id}:{timeout}"));
        match self.error_for("restart_container") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.record(format!("inspect_container:{id}"));
        match self.error_for("inspect_container") {
            Some(err) => Err(err),
            None => Ok(ContainerInspectResponse {
                id: Some(id.to_string()),
                ..Default::default()
            }),
        }
    }

    async fn create_exec(&self, id: &str, cmd: Vec<String>) -> Result<String> {
        self.record(format!("create_exec:{id}:{}", cmd.join(" ")));
        if let Some(err) = self.error_for("create_exec") {
            return Err(err);
        }
        Ok(self.exec.lock().unwrap().exec_id.clone())
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutputStream> {
        self.record(format!("start_exec:{exec_id}"));
        if let Some(err) = self.error_for("start_exec") {
            return Err(err);
        }

        let frames: Vec<Result<LogOutput>> = self
            .exec
            .lock()
            .unwrap()
            .output
            .iter()
            .map(|(is_stdout, payload)| {
                let message = Bytes::from(payload.clone());
                Ok(if *is_stdout {
                    LogOutput::StdOut { message }
                } else {
                    LogOutput::StdErr { message }
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<i64> {
        self.record(format!("inspect_exec:{exec_id}"));
        match self.error_for("inspect_exec") {
            Some(err) => Err(err),
            None => Ok(self.exec.lock().unwrap().exit_code),
        }
    }

    async fn list_services(&self, filters: Filters) -> Result<Vec<bollard::models::Service>> {
        self.record("list_services".to_string());
        if let Some(err) = self.error_for("list_services") {
            return Err(err);
        }

        let services = self.services.lock().unwrap().clone();
        Ok(match filters.get("id") {
            Some(ids) => services
                .into_iter()
                .filter(|s| ids.contains(s.id.as_ref().unwrap_or(&String::new())))
                .collect(),
            None => services,
        })
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: ServiceSpec,
    ) -> Result<Vec<String>> {
        let force_update = spec
            .task_template
            .as_ref()
            .and_then(|t| t.force_update)
            .unwrap_or_default();
        self.record(format!("update_service:{id}:{version}:{force_update}"));
        match self.error_for("update_service") {
            Some(err) => Err(err),
            None => Ok(self.update_warnings.lock().unwrap().clone()),
        }
    }

    fn events(&self, _filters: Filters) -> EventStream {
        self.record("events".to_string());
        match self.event_streams.lock().unwrap().pop_front() {
            Some(items) => Box::pin(futures::stream::iter(items)),
            None => Box::pin(futures::stream::pending()),
        }
    }
}
