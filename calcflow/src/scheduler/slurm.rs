//! SLURM command-line scheduler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::process::{ExitStatus, Output};
use tokio::process::Command;

use super::{JobId, JobStatus, Scheduler};
use crate::errors::{SchedulerError, SubmissionError};

/// Talks to SLURM through `sbatch`, `squeue` and `scancel`.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler {
    user: Option<String>,
}

impl SlurmScheduler {
    /// Creates a scheduler that lists every user's jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts queue listings to one user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by a signal".to_string(),
    }
}

/// Parses `sbatch --parsable` output (`id` or `id;cluster`), accepting the
/// plain `Submitted batch job <id>` form as well.
pub(crate) fn parse_submission(stdout: &str) -> Option<JobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let token = if line.starts_with("Submitted batch job") {
        line.split_whitespace().last()?
    } else {
        line.split(';').next()?
    };
    token.parse().ok().map(JobId)
}

/// Maps a squeue compact state code onto a live status.
fn status_from_code(code: &str) -> JobStatus {
    match code {
        "PD" | "CF" | "RQ" | "RF" | "RH" | "RS" | "S" | "SE" => JobStatus::Pending,
        "CD" | "F" | "CA" | "TO" | "NF" | "OOM" | "BF" | "DL" | "PR" => JobStatus::Absent,
        _ => JobStatus::Running,
    }
}

/// Parses `squeue -o "%i %t"` lines into statuses for the requested ids.
pub(crate) fn parse_queue(
    stdout: &str,
    ids: &[JobId],
) -> Result<HashMap<JobId, JobStatus>, SchedulerError> {
    let mut statuses: HashMap<JobId, JobStatus> =
        ids.iter().map(|id| (*id, JobStatus::Absent)).collect();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(raw_id), Some(code)) = (fields.next(), fields.next()) else {
            return Err(SchedulerError::UnexpectedOutput("squeue".into(), line.into()));
        };
        let base = raw_id.split(['_', '.']).next().unwrap_or(raw_id);
        let id = base
            .parse()
            .map(JobId)
            .map_err(|_| SchedulerError::UnexpectedOutput("squeue".into(), line.into()))?;
        if let Some(status) = statuses.get_mut(&id) {
            // Array tasks share a base id; any live task keeps the job live.
            let seen = status_from_code(code);
            if *status == JobStatus::Absent || seen == JobStatus::Running {
                *status = seen;
            }
        }
    }
    Ok(statuses)
}

fn check(command: &str, output: &Output) -> Result<(), SchedulerError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(SchedulerError::CommandFailed {
            command: command.to_string(),
            status: describe(output.status),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(&self, script: &Path) -> Result<JobId, SubmissionError> {
        let dir = script.parent().unwrap_or_else(|| Path::new("."));
        let file_name = script
            .file_name()
            .ok_or_else(|| SubmissionError::new("sbatch", "script path has no file name"))?;

        tracing::debug!(script = %script.display(), "Submitting with sbatch");
        let output = Command::new("sbatch")
            .arg("--parsable")
            .arg(file_name)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| SubmissionError::new("sbatch", format!("could not execute: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubmissionError::new(
                "sbatch",
                format!("{}: {}", describe(output.status), stderr.trim()),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_submission(&stdout).ok_or_else(|| {
            SubmissionError::new("sbatch", format!("unexpected output '{}'", stdout.trim()))
        })
    }

    async fn query(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, SchedulerError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut jobs = String::with_capacity(9 * ids.len());
        // squeue errors when the only requested job is unknown; a leading
        // placeholder id keeps the listing valid.
        if ids.len() == 1 {
            jobs.push_str("1,");
        }
        for id in ids {
            let _ = write!(jobs, "{id},");
        }

        tracing::debug!(jobs = %jobs, "Checking job status with squeue");
        let mut command = Command::new("squeue");
        command
            .arg("--noheader")
            .args(["-o", "%i %t"])
            .arg("--jobs")
            .arg(jobs.trim_end_matches(','));
        if let Some(user) = &self.user {
            command.args(["--user", user]);
        }
        let output = command
            .output()
            .await
            .map_err(|e| SchedulerError::SpawnProcess("squeue".into(), e))?;
        check("squeue", &output)?;

        parse_queue(&String::from_utf8_lossy(&output.stdout), ids)
    }

    async fn cancel(&self, id: JobId) -> Result<(), SchedulerError> {
        tracing::info!(job_id = %id, "Cancelling job");
        let output = Command::new("scancel")
            .arg(id.to_string())
            .output()
            .await
            .map_err(|e| SchedulerError::SpawnProcess("scancel".into(), e))?;
        check("scancel", &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_submission_forms() {
        assert_eq!(parse_submission("4182\n"), Some(JobId(4182)));
        assert_eq!(parse_submission("4182;perlmutter\n"), Some(JobId(4182)));
        assert_eq!(parse_submission("Submitted batch job 77\n"), Some(JobId(77)));
        assert_eq!(parse_submission("sbatch: error: quota\n"), None);
        assert_eq!(parse_submission(""), None);
    }

    #[test]
    fn test_parse_queue() {
        let ids = [JobId(10), JobId(11), JobId(12), JobId(13)];
        let out = "10 PD\n11 R\n12 CG\n99 R\n";
        let statuses = parse_queue(out, &ids).unwrap();
        assert_eq!(statuses[&JobId(10)], JobStatus::Pending);
        assert_eq!(statuses[&JobId(11)], JobStatus::Running);
        assert_eq!(statuses[&JobId(12)], JobStatus::Running);
        assert_eq!(statuses[&JobId(13)], JobStatus::Absent);
        assert!(!statuses.contains_key(&JobId(99)));
    }

    #[test]
    fn test_parse_queue_array_tasks() {
        let statuses = parse_queue("20_1 PD\n20_2 R\n", &[JobId(20)]).unwrap();
        assert_eq!(statuses[&JobId(20)], JobStatus::Running);
    }

    #[test]
    fn test_parse_queue_garbage() {
        assert!(parse_queue("lonely\n", &[JobId(1)]).is_err());
        assert!(parse_queue("abc R\n", &[JobId(1)]).is_err());
    }

    #[test]
    fn test_empty_query_runs_nothing() {
        let statuses = tokio_test::block_on(SlurmScheduler::new().query(&[])).unwrap();
        assert!(statuses.is_empty());
    }
}
