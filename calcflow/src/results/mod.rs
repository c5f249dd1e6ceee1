//! The JSON results aggregate and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::analysis::StageResult;
use crate::core::{MaterialStatus, StageKind, StageState};
use crate::engine::StageRecord;
use crate::errors::Result;

/// What the aggregate says about one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Lifecycle state; `not_ready` for stages never started.
    pub status: StageState,
    /// Result once converged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
    /// Retries used.
    pub retry_count: u32,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    /// A stage that has not been started.
    #[must_use]
    pub fn not_ready() -> Self {
        Self {
            status: StageState::NotReady,
            result: None,
            retry_count: 0,
            error: None,
        }
    }

    /// Report of a persisted stage.
    #[must_use]
    pub fn from_record(record: &StageRecord) -> Self {
        Self {
            status: record.state,
            result: record.result.clone(),
            retry_count: record.retry_count(),
            error: record.failure.clone(),
        }
    }
}

/// What the aggregate says about one material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialReport {
    /// Material status.
    pub status: MaterialStatus,
    /// Every configured stage, started or not.
    pub stages: BTreeMap<StageKind, StageReport>,
    /// Why the material could not be processed this tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MaterialReport {
    /// Report for a material whose task died before producing one.
    #[must_use]
    pub fn errored(stages: &[StageKind], error: impl Into<String>) -> Self {
        Self {
            status: MaterialStatus::Active,
            stages: stages.iter().map(|k| (*k, StageReport::not_ready())).collect(),
            error: Some(error.into()),
        }
    }

    /// Returns true if the stage converged.
    #[must_use]
    pub fn is_finished(&self, kind: StageKind) -> bool {
        self.stages
            .get(&kind)
            .is_some_and(|s| s.status == StageState::Converged)
    }
}

/// The `results.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsDocument {
    /// Driver invocation that produced it.
    pub run_id: Uuid,
    /// When it was written.
    pub generated_at: DateTime<Utc>,
    /// Material name → report.
    pub materials: BTreeMap<String, MaterialReport>,
}

impl ResultsDocument {
    /// Writes the document as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Counts for the CLI summary.
    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary::from_reports(&self.materials)
    }
}

/// Progress counts over every material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Materials with the stage converged, per stage kind.
    pub finished: BTreeMap<StageKind, usize>,
    /// Materials considered.
    pub total: usize,
    /// Materials halted by the sentinel.
    pub stopped: Vec<String>,
    /// Materials still active.
    pub unfinished: Vec<String>,
}

impl Summary {
    /// Tallies a set of reports.
    #[must_use]
    pub fn from_reports(reports: &BTreeMap<String, MaterialReport>) -> Self {
        let mut summary = Self {
            total: reports.len(),
            ..Self::default()
        };
        for (name, report) in reports {
            for (kind, stage) in &report.stages {
                let finished = summary.finished.entry(*kind).or_insert(0);
                if stage.status == StageState::Converged {
                    *finished += 1;
                }
            }
            match report.status {
                MaterialStatus::Stopped => summary.stopped.push(name.clone()),
                MaterialStatus::Active => summary.unfinished.push(name.clone()),
                MaterialStatus::Done => {}
            }
        }
        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "materials: {}", self.total)?;
        for (kind, count) in &self.finished {
            writeln!(f, "  {kind:<14} {count}/{}", self.total)?;
        }
        writeln!(f, "stopped: {}", self.stopped.join(", "))?;
        write!(f, "unfinished: {}", self.unfinished.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(status: MaterialStatus, states: &[(StageKind, StageState)]) -> MaterialReport {
        MaterialReport {
            status,
            stages: states
                .iter()
                .map(|(kind, state)| {
                    (
                        *kind,
                        StageReport {
                            status: *state,
                            ..StageReport::not_ready()
                        },
                    )
                })
                .collect(),
            error: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut reports = BTreeMap::new();
        reports.insert(
            "NaCl".to_string(),
            report(
                MaterialStatus::Done,
                &[(StageKind::Relax, StageState::Converged), (StageKind::Static, StageState::Converged)],
            ),
        );
        reports.insert(
            "MgO".to_string(),
            report(
                MaterialStatus::Stopped,
                &[(StageKind::Relax, StageState::Stopped), (StageKind::Static, StageState::NotReady)],
            ),
        );
        reports.insert(
            "Fe".to_string(),
            report(
                MaterialStatus::Active,
                &[(StageKind::Relax, StageState::Converged), (StageKind::Static, StageState::Running)],
            ),
        );

        let summary = Summary::from_reports(&reports);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.finished[&StageKind::Relax], 2);
        assert_eq!(summary.finished[&StageKind::Static], 1);
        assert_eq!(summary.stopped, vec!["MgO".to_string()]);
        assert_eq!(summary.unfinished, vec!["Fe".to_string()]);
        assert!(summary.to_string().contains("materials: 3"));
    }

    #[test]
    fn test_failed_stage_is_reported_not_omitted() {
        let mut reports = BTreeMap::new();
        let mut failed = report(MaterialStatus::Done, &[(StageKind::Static, StageState::Failed)]);
        if let Some(stage) = failed.stages.get_mut(&StageKind::Static) {
            stage.error = Some("fatal error in output: BRMIX".to_string());
        }
        reports.insert("NaCl".to_string(), failed);
        let document = ResultsDocument {
            run_id: Uuid::now_v7(),
            generated_at: Utc::now(),
            materials: reports,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        document.write(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["materials"]["NaCl"]["stages"]["static"]["status"], "failed");
        assert_eq!(
            value["materials"]["NaCl"]["stages"]["static"]["error"],
            "fatal error in output: BRMIX"
        );

        let back: ResultsDocument = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, document);
    }
}
