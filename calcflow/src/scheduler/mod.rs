//! Batch scheduler interface.
//!
//! The state machine only needs three primitives: submit a script, list
//! which jobs are still queued, and cancel one. [`SlurmScheduler`] maps
//! them onto `sbatch`, `squeue` and `scancel`.

mod slurm;

pub use slurm::SlurmScheduler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::errors::{SchedulerError, SubmissionError};

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live status of a job as seen in the queue listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for resources.
    Pending,
    /// Executing.
    Running,
    /// Not listed. Finished, failed or cancelled; the logs decide which.
    Absent,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// A batch scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submits a job script from its own directory.
    async fn submit(&self, script: &Path) -> Result<JobId, SubmissionError>;

    /// Reports the status of every requested id; unlisted ids are `Absent`.
    async fn query(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, SchedulerError>;

    /// Cancels a job.
    async fn cancel(&self, id: JobId) -> Result<(), SchedulerError>;
}
