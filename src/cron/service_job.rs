//! Scheduled actions against swarm services. The `update` action forces a
//! rolling update of an unchanged spec by bumping the task template's
//! force-update counter.

use crate::docker::DockerClient;
use crate::scheduler;
use anyhow::Result;
use async_trait::async_trait;
use bollard::models::ServiceSpec;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// A swarm service action run on a schedule, carrying the spec and version
/// captured when the service was scanned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceJob {
    pub schedule: String,
    pub action: String,
    pub timeout: String,
    pub command: String,
    pub service_id: String,
    pub service_name: String,
    pub version: u64,
    pub created: i64,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ServiceAction {
    Update,
    Exec,
}

pub(crate) struct ServiceJobRunner {
    job: ServiceJob,
    action: ServiceAction,
    cli: Arc<dyn DockerClient>,
    sync: TaskTracker,
}

impl ServiceJobRunner {
    pub(crate) fn new(
        job: ServiceJob,
        action: ServiceAction,
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

    async fn update(&self) -> Result<()> {
        let mut spec = self.job.spec.clone();
        spec.task_template
            .get_or_insert_with(Default::default)
            .force_update = Some(self.job.version as i64);

        let warnings = self
            .cli
            .update_service(&self.job.service_id, self.job.version, spec)
            .await?;
        for warning in warnings {
            warn!(
                service_id = %self.job.service_id,
                service_name = %self.job.service_name,
                warning = %warning,
                "service update returned a warning"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl scheduler::Job for ServiceJobRunner {
    async fn run(&self) {
        let _work = self.sync.token();

        let result = match self.action {
            ServiceAction::Update => self.update().await,
            // Only update reaches the engine; exec validates but has no
            // service-level wiring.
            ServiceAction::Exec => Ok(()),
        };

        match result {
            Ok(()) => info!(
                schedule = %self.job.schedule,
                action = %self.job.action,
                timeout = %self.job.timeout,
                command = %self.job.command,
                service_id = %self.job.service_id,
                service_name = %self.job.service_name,
                "service action completed successfully"
            ),
            Err(e) => error!(
                schedule = %self.job.schedule,
                action = %self.job.action,
                timeout = %self.job.timeout,
                command = %self.job.command,
                service_id = %self.job.service_id,
                service_name = %self.job.service_name,
                error = %format!("{e:#}"),
                "service job completed with error"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockDockerClient;
    use crate::scheduler::Job;
    use pretty_assertions::assert_eq;

    fn job() -> ServiceJob {
        ServiceJob {
            schedule: "* * * * *".to_string(),
            action: "update".to_string(),
            service_id: "s1".to_string(),
            service_name: "web".to_string(),
            version: 7,
            created: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_forces_a_rolling_update_at_the_stored_version() {
        let cli = Arc::new(MockDockerClient::new());
        let runner = ServiceJobRunner::new(job(), ServiceAction::Update, cli.clone(), TaskTracker::new());

        runner.run().await;

        // version and force-update counter both carry the stored index.
        assert_eq!(cli.calls(), vec!["update_service:s1:7:7"]);
    }

    #[tokio::test]
    async fn update_failure_is_contained() {
        let cli = Arc::new(MockDockerClient::new());
        cli.fail("update_service", "rpc error: update out of sequence");
        let runner = ServiceJobRunner::new(job(), ServiceAction::Update, cli.clone(), TaskTracker::new());

        // Errors are logged, never propagated into the scheduler.
        runner.run().await;

        assert_eq!(cli.calls(), vec!["update_service:s1:7:7"]);
    }

    #[tokio::test]
    async fn update_keeps_the_stored_spec() {
        let cli = Arc::new(MockDockerClient::new());
        let mut j = job();
        j.spec = ServiceSpec {
            name: Some("web".to_string()),
            ..Default::default()
        };
        let runner = ServiceJobRunner::new(j, ServiceAction::Update, cli.clone(), TaskTracker::new());

        runner.update().await.unwrap();

        assert_eq!(cli.calls(), vec!["update_service:s1:7:7"]);
    }

    #[tokio::test]
    async fn exec_action_makes_no_engine_call() {
        let cli = Arc::new(MockDockerClient::new());
        let mut j = job();
        j.action = "exec".to_string();
        j.command = "date".to_string();
        let runner = ServiceJobRunner::new(j, ServiceAction::Exec, cli.clone(), TaskTracker::new());

        runner.run().await;

        assert!(cli.calls().is_empty());
    }
}
