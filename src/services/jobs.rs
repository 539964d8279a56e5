//! Named recurring jobs with at-most-one concurrent run per name.

use crate::config::{JobSettings, Schedule};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A unit of recurring work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

/// What a trigger did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { elapsed: Duration },
    Failed { elapsed: Duration, error: String },
    /// A previous run still holds the lock.
    Skipped,
    Disabled,
    UnknownJob,
}

#[derive(Clone)]
struct RegisteredJob {
    job: Arc<dyn Job>,
    enabled: Arc<AtomicBool>,
    schedule: Schedule,
}

/// Releases a job lock when dropped, whatever way the run ended.
pub struct JobLockGuard<'a> {
    locks: &'a DashMap<String, bool>,
    name: String,
}

impl Drop for JobLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut locked) = self.locks.get_mut(&self.name) {
            *locked = false;
        }
    }
}

/// Process-wide scheduler for named jobs.
pub struct JobCoordinator {
    jobs: DashMap<String, RegisteredJob>,
    locks: DashMap<String, bool>,
    /// Venue clock for daily schedules.
    offset: FixedOffset,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobCoordinator {
    pub fn new(offset: FixedOffset) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            jobs: DashMap::new(),
            locks: DashMap::new(),
            offset,
            shutdown_tx,
        })
    }

    /// Register a job. Re-registering a name replaces the previous job.
    pub fn register(&self, job: Arc<dyn Job>, settings: &JobSettings) {
        let name = job.name().to_string();
        info!(
            "Registered job {} ({:?}, enabled: {})",
            name, settings.schedule, settings.enabled
        );
        self.jobs.insert(
            name,
            RegisteredJob {
                job,
                enabled: Arc::new(AtomicBool::new(settings.enabled)),
                schedule: settings.schedule,
            },
        );
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Flip a job's enable flag. Returns false for an unknown job.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.jobs.get(name) {
            Some(job) => {
                job.enabled.store(enabled, Ordering::SeqCst);
                info!("Job {} {}", name, if enabled { "enabled" } else { "disabled" });
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.locks.get(name).map(|l| *l).unwrap_or(false)
    }

    /// Take the lock for `name`, or `None` if it is already held.
    pub fn acquire(&self, name: &str) -> Option<JobLockGuard<'_>> {
        let mut locked = self.locks.entry(name.to_string()).or_insert(false);
        if *locked {
            return None;
        }
        *locked = true;
        Some(JobLockGuard {
            locks: &self.locks,
            name: name.to_string(),
        })
    }

    /// Run a job now, subject to its enable flag and lock.
    pub async fn trigger(&self, name: &str) -> JobOutcome {
        let registered = match self.jobs.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!("Trigger for unknown job {}", name);
                return JobOutcome::UnknownJob;
            }
        };

        if !registered.enabled.load(Ordering::SeqCst) {
            info!("Job {} is disabled, skipping", name);
            return JobOutcome::Disabled;
        }

        let _guard = match self.acquire(name) {
            Some(guard) => guard,
            None => {
                info!("Job {} is still running, skipping this firing", name);
                return JobOutcome::Skipped;
            }
        };

        info!("Job {} started", name);
        let started = Instant::now();
        match registered.job.run().await {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!("Job {} completed in {}ms", name, elapsed.as_millis());
                JobOutcome::Completed { elapsed }
            }
            Err(e) => {
                let elapsed = started.elapsed();
                error!("Job {} failed after {}ms: {}", name, elapsed.as_millis(), e);
                JobOutcome::Failed {
                    elapsed,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Spawn one scheduling loop per registered job.
    ///
    /// Each firing runs in its own task, so a long run never delays the
    /// schedule; overlapping firings are skipped by the lock instead.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let jobs: Vec<(String, Schedule)> = self
            .jobs
            .iter()
            .map(|e| (e.key().clone(), e.value().schedule))
            .collect();

        jobs.into_iter()
            .map(|(name, schedule)| {
                let coordinator = Arc::clone(self);
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        let delay = next_delay(&schedule, Utc::now(), coordinator.offset);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                let runner = Arc::clone(&coordinator);
                                let job_name = name.clone();
                                tokio::spawn(async move {
                                    runner.trigger(&job_name).await;
                                });
                            }
                            _ = shutdown_rx.recv() => {
                                info!("Scheduler for {} stopping", name);
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Stop all scheduling loops. Runs already in flight finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Time from `now` until the schedule next fires.
pub fn next_delay(schedule: &Schedule, now: DateTime<Utc>, offset: FixedOffset) -> Duration {
    match schedule {
        Schedule::Every(period) => *period,
        Schedule::DailyAt(at) => {
            let local = now.with_timezone(&offset).naive_local();
            let mut next = local.date().and_time(*at);
            if next <= local {
                next += ChronoDuration::days(1);
            }
            (next - local).to_std().unwrap_or(Duration::ZERO)
        }
    }
}
