//! The reconciler. Translates engine inventories and event streams into
//! registry calls so the job set follows container and service lifecycles
//! without a restart.

use super::{ContainerJob, Cronner, ServiceJob};
use crate::docker::{DockerClient, Filters};
use anyhow::Result;
use bollard::models::{ContainerSummary, EventMessage, Service};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const SCHEDULE_LABEL: &str = "mobycron.schedule";
const ACTION_LABEL: &str = "mobycron.action";
const TIMEOUT_LABEL: &str = "mobycron.timeout";
const COMMAND_LABEL: &str = "mobycron.command";

const SWARM_SERVICE_ID_LABEL: &str = "com.docker.swarm.service.id";
const SWARM_TASK_NAME_LABEL: &str = "com.docker.swarm.task.name";

/// Handles docker inventories and events for objects carrying a cron
/// schedule label.
pub struct Handler {
    cron: Arc<dyn Cronner>,
    cli: Arc<dyn DockerClient>,
}

impl Handler {
    pub fn new(cron: Arc<dyn Cronner>, cli: Arc<dyn DockerClient>) -> Self {
        Self { cron, cli }
    }

    /// Register a job for every labeled container currently known to the
    /// engine. Listing failures abort the scan; individual registration
    /// failures are logged and skipped so one bad label cannot starve the
    /// rest.
    pub async fn scan_containers(&self) -> Result<()> {
        info!("scan containers for cron schedule");

        let containers = self.cli.list_containers(label_filter()).await?;
        for container in &containers {
            self.add_container(container).await;
        }
        Ok(())
    }

    /// Register a job for every labeled swarm service.
    pub async fn scan_services(&self) -> Result<()> {
        info!("scan services for cron schedule");

        let services = self.cli.list_services(label_filter()).await?;
        for service in &services {
            self.add_service(service).await;
        }
        Ok(())
    }

    /// Follow container create/destroy events for labeled containers. An
    /// event-stream failure drops the subscription and immediately opens a
    /// fresh one; events raced during the gap are picked up by the next
    /// full scan.
    pub async fn listen_containers(&self) {
        info!("listen for container events");

        let mut filters = label_filter();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["create".to_string(), "destroy".to_string()],
        );

        loop {
            let mut events = self.cli.events(filters.clone());
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => self.handle_container_event(event).await,
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "container event stream failed, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    /// Follow service create/update/remove events.
    pub async fn listen_services(&self) {
        info!("listen for service events");

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["service".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                "create".to_string(),
                "remove".to_string(),
                "update".to_string(),
            ],
        );

        loop {
            let mut events = self.cli.events(filters.clone());
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => self.handle_service_event(event).await,
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "service event stream failed, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_container_event(&self, event: EventMessage) {
        let action = event.action.unwrap_or_default();
        let actor_id = event.actor.and_then(|a| a.id).unwrap_or_default();
        info!(action = %action, actor_id = %actor_id, "container event received");

        match action.as_str() {
            "create" => {
                let mut filters = label_filter();
                filters.insert("id".to_string(), vec![actor_id.clone()]);
                match self.cli.list_containers(filters).await {
                    Ok(containers) => {
                        for container in &containers {
                            self.add_container(container).await;
                        }
                    }
                    Err(e) => {
                        error!(
                            actor_id = %actor_id,
                            error = %format!("{e:#}"),
                            "failed to list container from event"
                        );
                    }
                }
            }
            "destroy" => self.cron.remove_container_job(&actor_id).await,
            _ => {}
        }
    }

    async fn handle_service_event(&self, event: EventMessage) {
        let action = event.action.unwrap_or_default();
        let actor_id = event.actor.and_then(|a| a.id).unwrap_or_default();
        info!(action = %action, actor_id = %actor_id, "service event received");

        match action.as_str() {
            "create" => self.scan_service(&actor_id).await,
            "update" => {
                // Drop the old entry first: a service whose label was
                // removed must not keep its schedule.
                self.cron.remove_service_job(&actor_id).await;
                self.scan_service(&actor_id).await;
            }
            "remove" => self.cron.remove_service_job(&actor_id).await,
            _ => {}
        }
    }

    async fn scan_service(&self, id: &str) {
        let mut filters = label_filter();
        filters.insert("id".to_string(), vec![id.to_string()]);
        match self.cli.list_services(filters).await {
            Ok(services) => {
                for service in &services {
                    self.add_service(service).await;
                }
            }
            Err(e) => {
                error!(
                    service_id = %id,
                    error = %format!("{e:#}"),
                    "failed to list service from event"
                );
            }
        }
    }

    async fn add_container(&self, container: &ContainerSummary) {
        let Some(job) = container_job_from(container) else {
            return;
        };
        if let Err(e) = self.cron.add_container_job(job).await {
            error!(error = %format!("{e:#}"), "add container job to cron is in error");
        }
    }

    async fn add_service(&self, service: &Service) {
        let Some(job) = service_job_from(service) else {
            return;
        };
        if let Err(e) = self.cron.add_service_job(job).await {
            error!(error = %format!("{e:#}"), "add service job to cron is in error");
        }
    }
}

fn label_filter() -> Filters {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![SCHEDULE_LABEL.to_string()]);
    filters
}

/// Map container labels onto a job descriptor. Swarm tasks are rejected:
/// swarm reschedules them under fresh ids, so scheduling follows the
/// service instead.
fn container_job_from(container: &ContainerSummary) -> Option<ContainerJob> {
    let labels = container.labels.clone().unwrap_or_default();

    if let Some(task_name) = labels.get(SWARM_TASK_NAME_LABEL) {
        let service_id = labels
            .get(SWARM_SERVICE_ID_LABEL)
            .cloned()
            .unwrap_or_default();
        match parse_slot(task_name) {
            Ok(slot) => warn!(
                task_name = %task_name,
                service_id = %service_id,
                slot,
                "swarm task containers are not scheduled directly, label the service instead"
            ),
            Err(e) => warn!(
                task_name = %task_name,
                service_id = %service_id,
                error = %e,
                "failed to parse the slot from the swarm task name"
            ),
        }
        return None;
    }

    Some(ContainerJob {
        schedule: labels.get(SCHEDULE_LABEL).cloned().unwrap_or_default(),
        action: labels
            .get(ACTION_LABEL)
            .cloned()
            .unwrap_or_else(|| "start".to_string()),
        timeout: labels.get(TIMEOUT_LABEL).cloned().unwrap_or_default(),
        command: labels.get(COMMAND_LABEL).cloned().unwrap_or_default(),
        container_id: container.id.clone().unwrap_or_default(),
        container_names: container.names.clone().unwrap_or_default(),
        service_id: String::new(),
        slot: 0,
        created: container.created.unwrap_or_default(),
    })
}

/// Map a swarm service onto a job descriptor; services without the
/// schedule label yield nothing.
fn service_job_from(service: &Service) -> Option<ServiceJob> {
    let spec = service.spec.clone().unwrap_or_default();
    let labels = spec.labels.clone().unwrap_or_default();
    labels.get(SCHEDULE_LABEL)?;

    Some(ServiceJob {
        schedule: labels.get(SCHEDULE_LABEL).cloned().unwrap_or_default(),
        action: labels
            .get(ACTION_LABEL)
            .cloned()
            .unwrap_or_else(|| "update".to_string()),
        timeout: labels.get(TIMEOUT_LABEL).cloned().unwrap_or_default(),
        command: labels.get(COMMAND_LABEL).cloned().unwrap_or_default(),
        service_id: service.id.clone().unwrap_or_default(),
        service_name: spec.name.clone().unwrap_or_default(),
        version: service.version.as_ref().and_then(|v| v.index).unwrap_or_default(),
        created: service
            .created_at
            .as_ref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp())
            .unwrap_or_default(),
        spec,
    })
}

/// The slot is the second dot-separated field of the swarm task name
/// (`service.slot.task-id`).
fn parse_slot(task_name: &str) -> Result<i64, String> {
    let field = task_name
        .split('.')
        .nth(1)
        .ok_or_else(|| format!("task name '{task_name}' has no slot field"))?;
    field
        .parse()
        .map_err(|_| format!("task name '{task_name}' has a non-numeric slot"))
}
