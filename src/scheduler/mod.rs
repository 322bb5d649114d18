//! The scheduler adapter wraps the cron-expression library and owns the set
//! of scheduled callables. The registry talks only to this seam; swapping
//! the underlying cron grammar implementation stays local to this module.

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Represents different scheduler failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// The cron spec could not be understood with the configured grammar.
    #[error("invalid cron spec '{spec}'; {reason}")]
    InvalidSpec { spec: String, reason: String },
}

/// The callable contract between the scheduler and job executors. The
/// scheduler needs nothing from a job other than the ability to run it.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// Opaque handle returned when a job is registered; used later to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Entry {
    schedule: Schedule,
    job: Arc<dyn Job>,
    cancel: CancellationToken,
    ticking: bool,
}

struct State {
    running: bool,
    next_id: u64,
    entries: HashMap<EntryId, Entry>,
}

/// Keeps track of any number of (schedule, callable) pairs and fires each
/// callable at its scheduled wall-clock times, every tick on its own task.
/// It may be started and stopped; in-progress runs outlive `stop`.
pub struct Scheduler {
    parse_second: bool,
    state: Arc<Mutex<State>>,
}

impl Scheduler {
    /// `parse_second` selects the six-field grammar with a leading seconds
    /// field; otherwise the standard five fields are expected.
    pub fn new(parse_second: bool) -> Self {
        Self {
            parse_second,
            state: Arc::new(Mutex::new(State {
                running: false,
                next_id: 1,
                entries: HashMap::new(),
            })),
        }
    }

    /// Parse the spec and register the job. If the scheduler is already
    /// running the job starts ticking immediately.
    pub fn add(&self, spec: &str, job: Arc<dyn Job>) -> Result<EntryId, SchedulerError> {
        let normalized = self.normalize_spec(spec)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSpec {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock().unwrap();
        let id = EntryId(state.next_id);
        state.next_id += 1;

        let mut entry = Entry {
            schedule,
            job,
            cancel: CancellationToken::new(),
            ticking: false,
        };
        if state.running {
            spawn_ticker(id, &mut entry);
        }
        state.entries.insert(id, entry);

        debug!(entry_id = %id, spec, "entry added to scheduler");
        Ok(id)
    }

    /// Cancel and drop the entry. Unknown ids are silently ignored.
    pub fn remove(&self, id: EntryId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.remove(&id) {
            entry.cancel.cancel();
            debug!(entry_id = %id, "entry removed from scheduler");
        }
    }

    /// Begin firing. Entries added while running are honored.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        for (id, entry) in state.entries.iter_mut() {
            if !entry.ticking {
                spawn_ticker(*id, entry);
            }
        }
    }

    /// Stop accepting new ticks. Callables already fired continue to run;
    /// draining them is the job synchroniser's concern, not ours.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        for entry in state.entries.values() {
            entry.cancel.cancel();
        }
    }

    /// Number of registered entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Widen five-field specs with a zero seconds field and translate the
    /// `@`-descriptors; the cron library itself always takes six fields.
    fn normalize_spec(&self, spec: &str) -> Result<String, SchedulerError> {
        let spec = spec.trim();

        if spec.starts_with('@') {
            let normalized = match spec {
                "@yearly" | "@annually" => "0 0 0 1 1 *",
                "@monthly" => "0 0 0 1 * *",
                "@weekly" => "0 0 0 * * Sun",
                "@daily" | "@midnight" => "0 0 0 * * *",
                "@hourly" => "0 0 * * * *",
                _ => {
                    return Err(SchedulerError::InvalidSpec {
                        spec: spec.to_string(),
                        reason: "unknown descriptor".to_string(),
                    })
                }
            };
            return Ok(normalized.to_string());
        }

        let fields = spec.split_whitespace().count();
        match (self.parse_second, fields) {
            (true, 6) => Ok(spec.to_string()),
            (false, 5) => Ok(format!("0 {spec}")),
            (true, n) => Err(SchedulerError::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("expected 6 fields, got {n}"),
            }),
            (false, n) => Err(SchedulerError::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("expected 5 fields, got {n}"),
            }),
        }
    }
}

/// Sleep until each upcoming occurrence and fire the job on its own task,
/// until cancelled or the schedule runs out of occurrences.
fn spawn_ticker(id: EntryId, entry: &mut Entry) {
    entry.ticking = true;
    let schedule = entry.schedule.clone();
    let job = Arc::clone(&entry.job);
    let cancel = entry.cancel.clone();

    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = match schedule.after(&now).next() {
                Some(next) => next,
                None => break,
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    let job = Arc::clone(&job);
                    tokio::spawn(async move { job.run().await });
                }
            }
        }
        debug!(entry_id = %id, "ticker stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_job() -> (Arc<dyn Job>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(CountingJob { runs: runs.clone() });
        (job, runs)
    }

    #[tokio::test]
    async fn add_accepts_five_fields_by_default() {
        let scheduler = Scheduler::new(false);
        let (job, _) = counting_job();
        scheduler.add("*/5 * * * *", job).unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn add_accepts_six_fields_with_parse_second() {
        let scheduler = Scheduler::new(true);
        let (job, _) = counting_job();
        scheduler.add("* * * * * *", job).unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn add_accepts_descriptors_in_both_grammars() {
        for parse_second in [false, true] {
            let scheduler = Scheduler::new(parse_second);
            let (job, _) = counting_job();
            scheduler.add("@hourly", job).unwrap();
        }
    }

    #[tokio::test]
    async fn add_rejects_wrong_field_count() {
        let scheduler = Scheduler::new(false);
        let (job, _) = counting_job();
        let err = scheduler.add("* * * * * *", job).unwrap_err();
        assert!(err.to_string().contains("expected 5 fields"));
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test]
    async fn add_rejects_garbage_spec() {
        let scheduler = Scheduler::new(false);
        let (job, _) = counting_job();
        scheduler.add("not a cron spec", job).unwrap_err();
    }

    #[tokio::test]
    async fn add_rejects_unknown_descriptor() {
        let scheduler = Scheduler::new(false);
        let (job, _) = counting_job();
        let err = scheduler.add("@fortnightly", job).unwrap_err();
        assert!(err.to_string().contains("unknown descriptor"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let scheduler = Scheduler::new(false);
        let (job, _) = counting_job();
        let id = scheduler.add("* * * * *", job).unwrap();
        scheduler.remove(id);
        scheduler.remove(id);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test]
    async fn started_scheduler_fires_every_second() {
        let scheduler = Scheduler::new(true);
        let (job, runs) = counting_job();
        scheduler.add("* * * * * *", job).unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        scheduler.stop();

        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn add_while_running_is_honored() {
        let scheduler = Scheduler::new(true);
        scheduler.start();

        let (job, runs) = counting_job();
        scheduler.add("* * * * * *", job).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        scheduler.stop();

        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stop_prevents_further_ticks() {
        let scheduler = Scheduler::new(true);
        let (job, runs) = counting_job();
        scheduler.add("* * * * * *", job).unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        scheduler.stop();

        // Let a tick that raced the stop finish before sampling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn removed_entry_no_longer_fires() {
        let scheduler = Scheduler::new(true);
        let (job, runs) = counting_job();
        let id = scheduler.add("* * * * * *", job).unwrap();

        scheduler.start();
        scheduler.remove(id);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        scheduler.stop();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
