//! Command jobs declared in the config file. The command and every
//! argument go through environment expansion before the child is spawned,
//! with `__FILE`-suffixed variables resolved through the file system so
//! secrets can live outside the environment.

use crate::fs::Filesystem;
use crate::scheduler;
use async_trait::async_trait;
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// A shell command run on a schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileJob {
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub(crate) struct FileJobRunner {
    job: FileJob,
    sync: TaskTracker,
    fs: Arc<dyn Filesystem>,
}

impl FileJobRunner {
    pub(crate) fn new(job: FileJob, sync: TaskTracker, fs: Arc<dyn Filesystem>) -> Self {
        Self { job, sync, fs }
    }

    /// Spawn the expanded command and collect its combined output.
    async fn execute(&self, output: &mut String) -> anyhow::Result<()> {
        let command = expand_env(&self.job.command, self.fs.as_ref());
        let args: Vec<String> = self
            .job
            .args
            .iter()
            .map(|arg| expand_env(arg, self.fs.as_ref()))
            .collect();

        let result = tokio::process::Command::new(&command)
            .args(&args)
            .output()
            .await?;

        output.push_str(&String::from_utf8_lossy(&result.stdout));
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        if !result.status.success() {
            match result.status.code() {
                Some(code) => anyhow::bail!("exit status {code}"),
                None => anyhow::bail!("terminated by signal"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl scheduler::Job for FileJobRunner {
    async fn run(&self) {
        let _work = self.sync.token();

        let mut output = String::new();
        match self.execute(&mut output).await {
            Ok(()) => info!(
                command = %self.job.command,
                args = %self.job.args.join(" "),
                output = %output,
                "job completed successfully"
            ),
            Err(e) => error!(
                command = %self.job.command,
                args = %self.job.args.join(" "),
                output = %output,
                error = %format!("{e:#}"),
                "job completed with error"
            ),
        }
    }
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// A variable whose name ends in `__FILE` holds a path; its expansion is
/// that file's contents, or the empty string when the read fails.
pub(crate) fn expand_env(input: &str, fs: &dyn Filesystem) -> String {
    regex!(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .replace_all(input, |caps: &lazy_regex::regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = env::var(name).unwrap_or_default();

            if name.ends_with("__FILE") {
                match fs.read_to_string(Path::new(&value)) {
                    Ok(secret) => secret,
                    Err(e) => {
                        error!(
                            variable = name,
                            path = %value,
                            error = %e,
                            "invalid secret environment variable"
                        );
                        String::new()
                    }
                }
            } else {
                value
            }
        })
        .into_owned()
}
