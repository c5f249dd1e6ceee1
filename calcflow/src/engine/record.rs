//! Persisted stage records.
//!
//! A [`StageRecord`] lives in `stage.json` inside its stage directory and
//! is the only state carried from one driver invocation to the next.

use chrono::{DateTime, Utc};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analysis::{StageResult, VoigtStrain};
use crate::config::{SiteConfig, StageParameters};
use crate::core::{Diagnostic, StageKind, StageState, Walltime};
use crate::scheduler::JobId;
use crate::structure::Structure;

/// SYMPREC applied by the symmetry remediation.
pub const TIGHT_SYMPREC: f64 = 1e-8;

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Scheduler id.
    pub id: JobId,
    /// When the scheduler accepted it.
    pub submitted_at: DateTime<Utc>,
}

/// One parameter change made in response to a recoverable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remediation {
    /// `ALGO = Fast`.
    AlgoFast,
    /// `SYMPREC = 1e-8`.
    SymprecTight,
    /// Leave more cores idle per node.
    MemoryReserve {
        /// Idle cores per node.
        cores_per_node: u32,
    },
}

impl Remediation {
    /// Applies the change to a parameter set. The memory reserve changes the
    /// job script, not the parameters.
    pub fn apply(&self, params: &mut StageParameters) {
        match self {
            Self::AlgoFast => params.algo = "Fast".to_string(),
            Self::SymprecTight => params.symprec = Some(TIGHT_SYMPREC),
            Self::MemoryReserve { .. } => {}
        }
    }
}

/// Lifecycle of one job directory: a plain stage or one strained sub-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Current state.
    pub state: StageState,
    /// Walltime of the next or current submission.
    pub walltime: Walltime,
    /// Resubmissions counted against the cap.
    #[serde(default)]
    pub retry_count: u32,
    /// Resubmissions after an unexplained crash.
    #[serde(default)]
    pub crash_count: u32,
    /// Output archives written so far.
    #[serde(default)]
    pub attempts: u32,
    /// Remediations in effect, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediations: Vec<Remediation>,
    /// The live job, if any.
    #[serde(default)]
    pub job: Option<JobRecord>,
    /// Passes that found the job gone but no output yet.
    #[serde(default)]
    pub undiagnosable_passes: u32,
    /// Diagnostic of the last finished job.
    #[serde(default)]
    pub last_diagnostic: Option<Diagnostic>,
    /// Why the run failed.
    #[serde(default)]
    pub failure: Option<String>,
    /// Fingerprint of the inputs last written.
    #[serde(default)]
    pub deck_fingerprint: Option<String>,
}

impl RunRecord {
    /// A queued run that has not been submitted yet.
    #[must_use]
    pub fn new(walltime: Walltime) -> Self {
        Self {
            state: StageState::Queued,
            walltime,
            retry_count: 0,
            crash_count: 0,
            attempts: 0,
            remediations: Vec::new(),
            job: None,
            undiagnosable_passes: 0,
            last_diagnostic: None,
            failure: None,
            deck_fingerprint: None,
        }
    }

    /// Stage parameters with every remediation applied.
    #[must_use]
    pub fn effective_params(&self, base: &StageParameters) -> StageParameters {
        let mut params = base.clone();
        for remediation in &self.remediations {
            remediation.apply(&mut params);
        }
        params
    }

    /// Idle cores per node for the next submission.
    #[must_use]
    pub fn memory_reserve(&self, site: &SiteConfig) -> u32 {
        self.remediations
            .iter()
            .rev()
            .find_map(|r| match r {
                Remediation::MemoryReserve { cores_per_node } => Some(*cores_per_node),
                _ => None,
            })
            .unwrap_or(site.memory_reserve_per_node)
    }

    /// Marks the run failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = StageState::Failed;
        self.failure = Some(reason.into());
        self.job = None;
    }
}

/// How a sub-run's structure differs from the stage input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deformation {
    /// Isotropic scaling of the lattice by a linear factor.
    Volume {
        /// Linear scale factor.
        scale: f64,
    },
    /// One Voigt strain component.
    Voigt(VoigtStrain),
}

impl Deformation {
    /// The deformed structure.
    #[must_use]
    pub fn apply(&self, structure: &Structure) -> Structure {
        match self {
            Self::Volume { scale } => structure.scaled_by(*scale),
            Self::Voigt(strain) => structure.deformed(&strain.tensor()),
        }
    }

    /// Strain applied, as a tensor; isotropic for volume scaling.
    #[must_use]
    pub fn tensor(&self) -> Matrix3<f64> {
        match self {
            Self::Volume { scale } => Matrix3::identity() * (scale - 1.0),
            Self::Voigt(strain) => strain.tensor(),
        }
    }
}

/// A strained sub-run of a bulk-modulus or elastic stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStage {
    /// Applied deformation.
    pub deformation: Deformation,
    /// Its own job lifecycle.
    pub run: RunRecord,
}

/// The job side of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageBody {
    /// One job in the stage directory.
    Single(RunRecord),
    /// Independent sub-runs keyed by directory name.
    Strained(BTreeMap<String, SubStage>),
}

/// Everything known about one stage of one material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage kind.
    pub kind: StageKind,
    /// Overall state.
    pub state: StageState,
    /// Parameters resolved when the stage was created.
    pub params: StageParameters,
    /// Runs are spin-polarised.
    pub use_spin: bool,
    /// The one-shot spin override has been used.
    #[serde(default)]
    pub spin_override_applied: bool,
    /// Job lifecycle.
    pub body: StageBody,
    /// Result once converged.
    #[serde(default)]
    pub result: Option<StageResult>,
    /// Why the stage failed.
    #[serde(default)]
    pub failure: Option<String>,
}

impl StageRecord {
    /// A new queued stage.
    #[must_use]
    pub fn new(kind: StageKind, params: StageParameters, use_spin: bool, body: StageBody) -> Self {
        Self {
            kind,
            state: StageState::Queued,
            params,
            use_spin,
            spin_override_applied: false,
            body,
            result: None,
            failure: None,
        }
    }

    /// Marks the stage failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = StageState::Failed;
        self.failure = Some(reason.into());
    }

    /// Retries used: the run's count, or the largest among sub-runs.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        match &self.body {
            StageBody::Single(run) => run.retry_count,
            StageBody::Strained(subs) => subs.values().map(|s| s.run.retry_count).max().unwrap_or(0),
        }
    }

    /// Every run of the stage.
    pub fn runs(&self) -> Box<dyn Iterator<Item = &RunRecord> + '_> {
        match &self.body {
            StageBody::Single(run) => Box::new(std::iter::once(run)),
            StageBody::Strained(subs) => Box::new(subs.values().map(|s| &s.run)),
        }
    }

    /// Every run of the stage, mutably.
    pub fn runs_mut(&mut self) -> Box<dyn Iterator<Item = &mut RunRecord> + '_> {
        match &mut self.body {
            StageBody::Single(run) => Box::new(std::iter::once(run)),
            StageBody::Strained(subs) => Box::new(subs.values_mut().map(|s| &mut s.run)),
        }
    }

    /// Ids of jobs believed to be in the queue.
    #[must_use]
    pub fn live_jobs(&self) -> Vec<JobId> {
        self.runs()
            .filter_map(|run| run.job.as_ref().map(|job| job.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remediations_apply_on_top() {
        let base = fixtures::stage_parameters();
        let mut run = RunRecord::new(base.walltime);
        run.remediations.push(Remediation::AlgoFast);
        run.remediations.push(Remediation::SymprecTight);

        let effective = run.effective_params(&base);
        assert_eq!(effective.algo, "Fast");
        assert_eq!(effective.symprec, Some(TIGHT_SYMPREC));
        assert_eq!(base.algo, "Normal");
    }

    #[test]
    fn test_memory_reserve_latest_wins() {
        let site = fixtures::site_config("/p");
        let mut run = RunRecord::new(Walltime::from_hours(1));
        assert_eq!(run.memory_reserve(&site), 4);
        run.remediations.push(Remediation::MemoryReserve { cores_per_node: 14 });
        assert_eq!(run.memory_reserve(&site), 14);
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let params = fixtures::stage_parameters();
        let mut subs = BTreeMap::new();
        subs.insert(
            "strain_-1".to_string(),
            SubStage {
                deformation: Deformation::Volume { scale: 0.99 },
                run: RunRecord::new(params.walltime),
            },
        );
        let mut record = StageRecord::new(StageKind::BulkModulus, params, true, StageBody::Strained(subs));
        if let StageBody::Strained(subs) = &mut record.body {
            if let Some(sub) = subs.get_mut("strain_-1") {
                sub.run.job = Some(JobRecord {
                    id: JobId(7),
                    submitted_at: Utc::now(),
                });
            }
        }

        let text = serde_json::to_string_pretty(&record).unwrap();
        let back: StageRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.live_jobs(), vec![JobId(7)]);
        assert!(text.contains("\"strained\""));
    }

    #[test]
    fn test_volume_deformation_scales_lattice() {
        let s = fixtures::nacl_structure();
        let scaled = Deformation::Volume { scale: 1.02 }.apply(&s);
        assert!((scaled.volume() / s.volume() - 1.02_f64.powi(3)).abs() < 1e-12);
    }
}
