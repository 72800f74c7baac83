//! Scheduled jobs and their once-per-window guard.
//!
//! A job may be triggered by the interval scheduler, by `POST /jobs/{job}`
//! or by `herald run-job`. Time is cut into windows of the job's interval;
//! within one process a job runs at most once per window, whoever triggers
//! it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald_core::Timestamp;

use crate::config::JobsConfig;
use crate::error::{RootError, RootResult};
use crate::HeraldApp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Job {
    DriftCorrection,
    Subsidiarity,
    Firmness,
    ProofPoll,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::DriftCorrection,
        Job::Subsidiarity,
        Job::Firmness,
        Job::ProofPoll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::DriftCorrection => "drift-correction",
            Job::Subsidiarity => "subsidiarity",
            Job::Firmness => "firmness",
            Job::ProofPoll => "proof-poll",
        }
    }

    pub fn interval_secs(&self, config: &JobsConfig) -> u64 {
        match self {
            Job::DriftCorrection => config.drift_interval_secs,
            Job::Subsidiarity => config.subsidiarity_interval_secs,
            Job::Firmness => config.firmness_interval_secs,
            Job::ProofPoll => config.proof_poll_interval_secs,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = RootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Job::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| RootError::NotFound(format!("job {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Ran {
        job: Job,
        window: u64,
        report: serde_json::Value,
    },
    Skipped {
        job: Job,
        window: u64,
    },
}

impl JobOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, JobOutcome::Ran { .. })
    }
}

/// Claims job windows.
pub struct JobRunner {
    intervals: HashMap<Job, u64>,
    claimed: Mutex<HashMap<Job, u64>>,
}

impl JobRunner {
    pub fn new(config: &JobsConfig) -> Self {
        Self {
            intervals: Job::ALL
                .into_iter()
                .map(|job| (job, job.interval_secs(config).max(1)))
                .collect(),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self, job: Job, now: Timestamp) -> u64 {
        let interval = self.intervals.get(&job).copied().unwrap_or(1);
        now.seconds_since_epoch / interval
    }

    /// Claim the window containing `now`. `None` when it is already taken.
    pub fn claim(&self, job: Job, now: Timestamp) -> RootResult<Option<u64>> {
        let window = self.window(job, now);
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|_| RootError::Config("job runner lock poisoned".into()))?;
        match claimed.get(&job) {
            Some(&last) if last >= window => Ok(None),
            _ => {
                claimed.insert(job, window);
                Ok(Some(window))
            }
        }
    }

    /// Give a window back after a failed run so a retry can take it.
    pub fn release(&self, job: Job, window: u64) -> RootResult<()> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|_| RootError::Config("job runner lock poisoned".into()))?;
        if claimed.get(&job) == Some(&window) {
            claimed.remove(&job);
        }
        Ok(())
    }
}

/// One interval task per job. Each tick tries to claim the current window.
pub fn spawn_scheduler(app: Arc<HeraldApp>) -> Vec<tokio::task::JoinHandle<()>> {
    Job::ALL
        .into_iter()
        .map(|job| {
            let app = app.clone();
            let period = Duration::from_secs(job.interval_secs(&app.config.jobs).max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match app.run_job(job, Timestamp::now()).await {
                        Ok(JobOutcome::Ran { report, .. }) => {
                            tracing::info!(job = %job, %report, "scheduled job finished");
                        }
                        Ok(JobOutcome::Skipped { window, .. }) => {
                            tracing::debug!(job = %job, window, "window already taken");
                        }
                        Err(e) => tracing::error!(job = %job, error = %e, "scheduled job failed"),
                    }
                }
            })
        })
        .collect()
}
