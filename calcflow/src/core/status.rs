//! Stage kind, stage state and material status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// The kind of calculation a stage performs.
///
/// Variants are declared in workflow order; [`StageKind::ALL`] follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    /// Cheap relaxation from the user-supplied structure.
    #[serde(alias = "rlx-coarse")]
    CoarseRelax,
    /// Production relaxation.
    #[serde(alias = "rlx")]
    Relax,
    /// Single-point calculation on the relaxed structure.
    Static,
    /// Energy-volume series fitted to an equation of state.
    #[serde(alias = "bulkmod")]
    BulkModulus,
    /// Strain-stress series giving the elastic tensor.
    Elastic,
}

impl StageKind {
    /// Every kind, in workflow order.
    pub const ALL: [Self; 5] = [
        Self::CoarseRelax,
        Self::Relax,
        Self::Static,
        Self::BulkModulus,
        Self::Elastic,
    ];

    /// Name of the stage directory inside a material directory.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::CoarseRelax => "rlx-coarse",
            Self::Relax => "rlx",
            Self::Static => "static",
            Self::BulkModulus => "bulkmod",
            Self::Elastic => "elastic",
        }
    }

    /// Prefix prepended to the material name to form the scheduler job name.
    #[must_use]
    pub const fn job_prefix(self) -> &'static str {
        match self {
            Self::CoarseRelax => "rc",
            Self::Relax => "r",
            Self::Static => "s",
            Self::BulkModulus => "b",
            Self::Elastic => "e",
        }
    }

    /// Returns true for stages that move ions and cell.
    #[must_use]
    pub const fn is_relaxation(self) -> bool {
        matches!(self, Self::CoarseRelax | Self::Relax)
    }

    /// Returns true for stages made of independently submitted strained runs.
    #[must_use]
    pub const fn has_substages(self) -> bool {
        matches!(self, Self::BulkModulus | Self::Elastic)
    }

    /// The stage that must converge before this one may start, given the
    /// kinds configured for the workflow.
    #[must_use]
    pub fn prerequisite(self, configured: &[Self]) -> Option<Self> {
        let candidates: &[Self] = match self {
            Self::CoarseRelax => &[],
            Self::Relax => &[Self::CoarseRelax],
            Self::Static | Self::BulkModulus | Self::Elastic => {
                &[Self::Relax, Self::CoarseRelax]
            }
        };
        candidates.iter().copied().find(|k| configured.contains(k))
    }

    /// Sorts and deduplicates a list of kinds into workflow order.
    #[must_use]
    pub fn in_workflow_order(kinds: &[Self]) -> Vec<Self> {
        let mut sorted = kinds.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoarseRelax => write!(f, "coarse-relax"),
            Self::Relax => write!(f, "relax"),
            Self::Static => write!(f, "static"),
            Self::BulkModulus => write!(f, "bulk-modulus"),
            Self::Elastic => write!(f, "elastic"),
        }
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coarse-relax" | "rlx-coarse" => Ok(Self::CoarseRelax),
            "relax" | "rlx" => Ok(Self::Relax),
            "static" => Ok(Self::Static),
            "bulk-modulus" | "bulkmod" => Ok(Self::BulkModulus),
            "elastic" => Ok(Self::Elastic),
            other => Err(ConfigError::new(format!("Unknown stage kind '{other}'"))),
        }
    }
}

/// Lifecycle state of a stage or sub-stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Waiting for its prerequisite.
    #[default]
    NotReady,
    /// Rendered, and submitted or waiting to be submitted.
    Queued,
    /// The job is in the scheduler queue and running.
    Running,
    /// The last run needs another attempt.
    NeedsRetry,
    /// Finished and analysed.
    Converged,
    /// Gave up.
    Failed,
    /// Halted by the stop sentinel.
    Stopped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "not_ready"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::NeedsRetry => write!(f, "needs_retry"),
            Self::Converged => write!(f, "converged"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl StageState {
    /// Returns true if the state cannot change again within a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed | Self::Stopped)
    }

    /// Returns true while a job may be live for the stage.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::NeedsRetry)
    }
}

/// Status flag of a material as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialStatus {
    /// Stages are still being advanced.
    #[default]
    Active,
    /// The stop sentinel is present.
    Stopped,
    /// Every configured stage is terminal.
    Done,
}

impl fmt::Display for MaterialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display_and_parse() {
        for kind in StageKind::ALL {
            assert_eq!(kind.to_string().parse::<StageKind>().ok(), Some(kind));
            assert_eq!(kind.dir_name().parse::<StageKind>().ok(), Some(kind));
        }
        assert!("phonons".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_stage_kind_serde_aliases() {
        let kind: StageKind = serde_json::from_str("\"bulkmod\"").unwrap();
        assert_eq!(kind, StageKind::BulkModulus);
        let kind: StageKind = serde_json::from_str("\"coarse-relax\"").unwrap();
        assert_eq!(kind, StageKind::CoarseRelax);
        assert_eq!(serde_json::to_string(&StageKind::Relax).unwrap(), "\"relax\"");
    }

    #[test]
    fn test_prerequisites() {
        let all = StageKind::ALL;
        assert_eq!(StageKind::CoarseRelax.prerequisite(&all), None);
        assert_eq!(StageKind::Relax.prerequisite(&all), Some(StageKind::CoarseRelax));
        assert_eq!(StageKind::Elastic.prerequisite(&all), Some(StageKind::Relax));

        let no_relax = [StageKind::CoarseRelax, StageKind::Static];
        assert_eq!(
            StageKind::Static.prerequisite(&no_relax),
            Some(StageKind::CoarseRelax)
        );
        assert_eq!(StageKind::Relax.prerequisite(&[StageKind::Relax]), None);
        assert_eq!(StageKind::BulkModulus.prerequisite(&[StageKind::BulkModulus]), None);
    }

    #[test]
    fn test_workflow_order() {
        let kinds = [StageKind::Static, StageKind::CoarseRelax, StageKind::Static];
        assert_eq!(
            StageKind::in_workflow_order(&kinds),
            vec![StageKind::CoarseRelax, StageKind::Static]
        );
    }

    #[test]
    fn test_stage_state_terminal() {
        assert!(StageState::Converged.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(StageState::Stopped.is_terminal());
        assert!(!StageState::NeedsRetry.is_terminal());
        assert!(!StageState::NotReady.is_terminal());
        assert!(StageState::Running.is_active());
        assert!(!StageState::NotReady.is_active());
    }

    #[test]
    fn test_stage_state_display_matches_serde() {
        let state = StageState::NeedsRetry;
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            format!("\"{state}\"")
        );
    }
}
