//! An in-memory scheduler for driving the engine in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::{SchedulerError, SubmissionError};
use crate::scheduler::{JobId, JobStatus, Scheduler};

/// A scheduler whose queue is whatever the test says it is.
///
/// Submitted jobs start `Pending` and stay listed until [`finish`] or a
/// cancel removes them.
///
/// [`finish`]: FakeScheduler::finish
#[derive(Debug, Default)]
pub struct FakeScheduler {
    next_id: Mutex<u64>,
    queue: Mutex<HashMap<JobId, JobStatus>>,
    submitted: Mutex<Vec<(JobId, PathBuf)>>,
    cancelled: Mutex<Vec<JobId>>,
    failing_submits: Mutex<usize>,
    query_failure: Mutex<bool>,
    query_count: Mutex<usize>,
}

impl FakeScheduler {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` submissions.
    pub fn fail_next_submits(&self, count: usize) {
        *self.failing_submits.lock() = count;
    }

    /// Makes every query fail until reset.
    pub fn set_query_failure(&self, failing: bool) {
        *self.query_failure.lock() = failing;
    }

    /// Sets a job's queue status.
    pub fn set_status(&self, id: JobId, status: JobStatus) {
        let mut queue = self.queue.lock();
        if status == JobStatus::Absent {
            queue.remove(&id);
        } else {
            queue.insert(id, status);
        }
    }

    /// Removes a job from the queue listing.
    pub fn finish(&self, id: JobId) {
        self.queue.lock().remove(&id);
    }

    /// Removes every job from the queue listing.
    pub fn finish_all(&self) {
        self.queue.lock().clear();
    }

    /// Every accepted submission, oldest first.
    #[must_use]
    pub fn submissions(&self) -> Vec<(JobId, PathBuf)> {
        self.submitted.lock().clone()
    }

    /// Number of accepted submissions.
    #[must_use]
    pub fn submit_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Accepted submissions whose script lives under `dir`.
    #[must_use]
    pub fn submissions_under(&self, dir: &Path) -> Vec<JobId> {
        self.submitted
            .lock()
            .iter()
            .filter(|(_, script)| script.starts_with(dir))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Jobs cancelled so far.
    #[must_use]
    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }

    /// Jobs currently listed.
    #[must_use]
    pub fn listed(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.queue.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of queue queries answered or refused.
    #[must_use]
    pub fn query_count(&self) -> usize {
        *self.query_count.lock()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn submit(&self, script: &Path) -> Result<JobId, SubmissionError> {
        {
            let mut failing = self.failing_submits.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(SubmissionError::new(
                    "sbatch",
                    "Batch job submission failed: Invalid account",
                ));
            }
        }
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            JobId(*next)
        };
        self.queue.lock().insert(id, JobStatus::Pending);
        self.submitted.lock().push((id, script.to_path_buf()));
        Ok(id)
    }

    async fn query(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, SchedulerError> {
        *self.query_count.lock() += 1;
        if *self.query_failure.lock() {
            return Err(SchedulerError::CommandFailed {
                command: "squeue".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "slurm_load_jobs error: Socket timed out".to_string(),
            });
        }
        let queue = self.queue.lock();
        Ok(ids
            .iter()
            .map(|id| (*id, queue.get(id).copied().unwrap_or(JobStatus::Absent)))
            .collect())
    }

    async fn cancel(&self, id: JobId) -> Result<(), SchedulerError> {
        self.queue.lock().remove(&id);
        self.cancelled.lock().push(id);
        Ok(())
    }
}
