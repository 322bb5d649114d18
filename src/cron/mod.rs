//! The job registry. `Cron` owns the scheduler adapter and the job
//! synchroniser, validates incoming job descriptors, and keeps the
//! container/service index maps that back replacement and removal.

mod container_job;
mod file_job;
mod handler;
mod service_job;

pub use container_job::ContainerJob;
pub use file_job::FileJob;
pub use handler::Handler;
pub use service_job::ServiceJob;

use crate::docker::DockerClient;
use crate::fs::Filesystem;
use crate::scheduler::{EntryId, Scheduler};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use container_job::{ContainerAction, ContainerJobRunner};
use file_job::FileJobRunner;
use service_job::{ServiceAction, ServiceJobRunner};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::info;

/// The registry surface the reconciler drives. Split out as a trait so
/// reconciler tests can record calls instead of running a real scheduler.
#[async_trait]
pub trait Cronner: Send + Sync {
    async fn add_container_job(&self, job: ContainerJob) -> Result<()>;
    async fn add_service_job(&self, job: ServiceJob) -> Result<()>;
    async fn remove_container_job(&self, key: &str);
    async fn remove_service_job(&self, id: &str);
}

/// A live scheduler entry tracked by one of the index maps.
#[derive(Debug, Clone, Copy)]
struct Entry {
    id: EntryId,
    created: i64,
}

/// Keeps track of any number of jobs, firing them as specified by their
/// schedules. May be started and stopped; stopping drains in-flight runs.
pub struct Cron {
    scheduler: Scheduler,
    sync: TaskTracker,
    fs: Arc<dyn Filesystem>,
    docker: Option<Arc<dyn DockerClient>>,
    container_jobs: Mutex<HashMap<String, Entry>>,
    service_jobs: Mutex<HashMap<String, Entry>>,
}

impl Cron {
    /// `docker` is only needed for container/service jobs; file-job-only
    /// deployments run without an engine connection.
    pub fn new(
        parse_second: bool,
        docker: Option<Arc<dyn DockerClient>>,
        fs: Arc<dyn Filesystem>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(parse_second),
            sync: TaskTracker::new(),
            fs,
            docker,
            container_jobs: Mutex::new(HashMap::new()),
            service_jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Add a command job to be run on the given schedule.
    pub async fn add_file_job(&self, job: FileJob) -> Result<()> {
        info!(
            schedule = %job.schedule,
            command = %job.command,
            args = %job.args.join(" "),
            "add job to cron"
        );

        if job.schedule.is_empty() {
            bail!("schedule is required");
        }
        if job.command.is_empty() {
            bail!("command is required");
        }

        let schedule = job.schedule.clone();
        let runner = Arc::new(FileJobRunner::new(job, self.sync.clone(), self.fs.clone()));
        self.scheduler
            .add(&schedule, runner)
            .context("failed to add job in cron")?;
        Ok(())
    }

    /// Add jobs in order; the first failure aborts the rest.
    pub async fn add_file_jobs(&self, jobs: Vec<FileJob>) -> Result<()> {
        for job in jobs {
            self.add_file_job(job).await?;
        }
        Ok(())
    }

    /// Add a container job, replacing a same-key entry when the incoming
    /// job was created strictly later. Same-key adds are serialized by the
    /// index lock; the last writer by creation time wins.
    pub async fn add_container_job(&self, job: ContainerJob) -> Result<()> {
        info!(
            schedule = %job.schedule,
            action = %job.action,
            timeout = %job.timeout,
            command = %job.command,
            container_id = %job.container_id,
            container_names = %job.container_names.join(","),
            "add container job to cron"
        );

        let action = validate_container_job(&job)?;
        let docker = self
            .docker
            .clone()
            .ok_or_else(|| anyhow!("docker client is required"))?;

        let mut jobs = self.container_jobs.lock().await;
        let key = job.index_key();

        if let Some(existing) = jobs.get(&key) {
            if existing.created >= job.created {
                info!(key = %key, "skip replacement, the container job is older");
                return Ok(());
            }
        }

        if let Some(existing) = jobs.remove(&key) {
            self.scheduler.remove(existing.id);
            info!(key = %key, "replace container job in cron");
        }

        let created = job.created;
        let schedule = job.schedule.clone();
        let runner = Arc::new(ContainerJobRunner::new(
            job,
            action,
            docker,
            self.sync.clone(),
        ));
        let id = self
            .scheduler
            .add(&schedule, runner)
            .context("failed to add container job in cron")?;
        jobs.insert(key, Entry { id, created });
        Ok(())
    }

    /// Add a service job; an existing entry for the same service is
    /// replaced unconditionally (service updates always supersede).
    pub async fn add_service_job(&self, job: ServiceJob) -> Result<()> {
        info!(
            schedule = %job.schedule,
            action = %job.action,
            timeout = %job.timeout,
            command = %job.command,
            service_id = %job.service_id,
            service_name = %job.service_name,
            "add service job to cron"
        );

        let action = validate_service_job(&job)?;
        let docker = self
            .docker
            .clone()
            .ok_or_else(|| anyhow!("docker client is required"))?;

        let mut jobs = self.service_jobs.lock().await;
        let key = job.service_id.clone();

        if let Some(existing) = jobs.remove(&key) {
            self.scheduler.remove(existing.id);
            info!(service_id = %key, "replace service job in cron");
        }

        let created = job.created;
        let schedule = job.schedule.clone();
        let runner = Arc::new(ServiceJobRunner::new(job, action, docker, self.sync.clone()));
        let id = self
            .scheduler
            .add(&schedule, runner)
            .context("failed to add service job in cron")?;
        jobs.insert(key, Entry { id, created });
        Ok(())
    }

    /// Remove the container job stored under `key`; unknown keys are
    /// silently ignored.
    pub async fn remove_container_job(&self, key: &str) {
        let mut jobs = self.container_jobs.lock().await;
        if let Some(entry) = jobs.remove(key) {
            self.scheduler.remove(entry.id);
            info!(key = %key, "remove container job from cron");
        }
    }

    /// Remove the service job for `id`; unknown ids are silently ignored.
    pub async fn remove_service_job(&self, id: &str) {
        let mut jobs = self.service_jobs.lock().await;
        if let Some(entry) = jobs.remove(id) {
            self.scheduler.remove(entry.id);
            info!(service_id = %id, "remove service job from cron");
        }
    }

    /// Read file jobs from a JSON config file and add them to the cron.
    pub async fn load_config(&self, filename: &Path) -> Result<()> {
        info!(filename = %filename.display(), "load config file");

        let config = self
            .fs
            .read_to_string(filename)
            .context("failed to read config file")?;
        let jobs: Vec<FileJob> = serde_json::from_str(&config)
            .context("failed to parse JSON data from config file")?;

        self.add_file_jobs(jobs)
            .await
            .context("failed to add jobs from config file")
    }

    /// Start firing scheduled jobs.
    pub fn start(&self) {
        info!("start cron");
        self.scheduler.start();
    }

    /// Stop the scheduler and wait for every in-flight job to finish.
    pub async fn stop(&self) {
        info!("stopping cron, wait for running jobs");
        self.scheduler.stop();
        self.sync.close();
        self.sync.wait().await;
        info!("cron is stopped, all jobs are completed");
    }
}

#[async_trait]
impl Cronner for Cron {
    async fn add_container_job(&self, job: ContainerJob) -> Result<()> {
        Cron::add_container_job(self, job).await
    }

    async fn add_service_job(&self, job: ServiceJob) -> Result<()> {
        Cron::add_service_job(self, job).await
    }

    async fn remove_container_job(&self, key: &str) {
        Cron::remove_container_job(self, key).await
    }

    async fn remove_service_job(&self, id: &str) {
        Cron::remove_service_job(self, id).await
    }
}

fn validate_container_job(job: &ContainerJob) -> Result<ContainerAction> {
    if job.schedule.is_empty() {
        bail!("schedule is required");
    }
    if !job.timeout.is_empty() && job.timeout.parse::<i64>().is_err() {
        bail!("timeout must be an integer");
    }

    let action = ContainerAction::from_str(&job.action)
        .map_err(|_| anyhow!("action must be one of 'start', 'restart', 'stop' or 'exec'"))?;
    match action {
        ContainerAction::Exec => {
            if job.command.is_empty() {
                bail!("command is required");
            }
        }
        _ => {
            if !job.command.is_empty() {
                bail!("command is only allowed with the 'exec' action");
            }
        }
    }
    Ok(action)
}

fn validate_service_job(job: &ServiceJob) -> Result<ServiceAction> {
    if job.schedule.is_empty() {
        bail!("schedule is required");
    }
    if !job.timeout.is_empty() && job.timeout.parse::<i64>().is_err() {
        bail!("timeout must be an integer");
    }

    let action = ServiceAction::from_str(&job.action)
        .map_err(|_| anyhow!("action must be one of 'update' or 'exec'"))?;
    match action {
        ServiceAction::Exec => {
            if job.command.is_empty() {
                bail!("command is required");
            }
        }
        ServiceAction::Update => {
            if !job.command.is_empty() {
                bail!("command is only allowed with the 'exec' action");
            }
        }
    }
    Ok(action)
}
