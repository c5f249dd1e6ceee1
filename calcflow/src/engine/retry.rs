//! Retry policy: what to do with a run that has left the queue.

use crate::config::{SiteConfig, StageParameters, WorkflowConfig};
use crate::core::{Diagnostic, RecoverableError, Walltime};

use super::record::{Remediation, RunRecord, TIGHT_SYMPREC};

/// Limits applied to every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resubmissions allowed before a run fails.
    pub max_retries: u32,
    /// Walltime ceiling for escalation.
    pub max_walltime: Walltime,
    /// Idle cores per node once memory is the problem.
    pub oom_memory_reserve: u32,
}

impl RetryPolicy {
    /// Policy from the workflow and site settings.
    #[must_use]
    pub fn new(workflow: &WorkflowConfig, site: &SiteConfig) -> Self {
        Self {
            max_retries: workflow.max_retries,
            max_walltime: workflow.max_walltime,
            oom_memory_reserve: site.oom_memory_reserve(),
        }
    }
}

/// Outcome of one diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The run converged; analyze it.
    Accept,
    /// Resubmit as a continuation.
    Continue {
        /// Walltime for the next submission.
        walltime: Walltime,
        /// Parameter change to add, if any.
        remediation: Option<Remediation>,
        /// The run crashed without explanation.
        crashed: bool,
    },
    /// Give up.
    Fail(String),
}

/// Maps a diagnostic to an action.
///
/// `params` are the run's effective parameters, with earlier remediations
/// already applied. Every continuation counts toward the retry cap.
#[must_use]
pub fn decide(
    diagnostic: &Diagnostic,
    run: &RunRecord,
    params: &StageParameters,
    reserve: u32,
    policy: &RetryPolicy,
) -> RetryDecision {
    let remediation = match diagnostic {
        Diagnostic::Converged => return RetryDecision::Accept,
        Diagnostic::NumericalErrorFatal { pattern } => {
            return RetryDecision::Fail(format!("fatal error in output: {pattern}"));
        }
        Diagnostic::NumericalErrorRecoverable { error } => {
            match remediation_for(*error, params, reserve, policy) {
                Some(remediation) => Some(remediation),
                None => {
                    return RetryDecision::Fail(format!(
                        "{error} persists with its remediation already applied"
                    ));
                }
            }
        }
        Diagnostic::CrashedUnknown if run.crash_count > 0 => {
            return RetryDecision::Fail("crashed twice without a diagnosable cause".to_string());
        }
        Diagnostic::WalltimeExceeded | Diagnostic::UnconvergedContinue | Diagnostic::CrashedUnknown => None,
    };

    if run.retry_count >= policy.max_retries {
        return RetryDecision::Fail(format!(
            "retry limit of {} reached ({diagnostic})",
            policy.max_retries
        ));
    }

    let walltime = if *diagnostic == Diagnostic::WalltimeExceeded {
        run.walltime.doubled(policy.max_walltime)
    } else {
        run.walltime
    };
    RetryDecision::Continue {
        walltime,
        remediation,
        crashed: *diagnostic == Diagnostic::CrashedUnknown,
    }
}

fn remediation_for(
    error: RecoverableError,
    params: &StageParameters,
    reserve: u32,
    policy: &RetryPolicy,
) -> Option<Remediation> {
    match error {
        RecoverableError::SubspaceMatrix => {
            (!params.algo.eq_ignore_ascii_case("fast")).then_some(Remediation::AlgoFast)
        }
        RecoverableError::InconsistentBravais => params
            .symprec
            .map_or(true, |s| s > TIGHT_SYMPREC)
            .then_some(Remediation::SymprecTight),
        RecoverableError::OutOfMemory => (reserve < policy.oom_memory_reserve).then_some(
            Remediation::MemoryReserve {
                cores_per_node: policy.oom_memory_reserve,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            max_walltime: Walltime::from_hours(8),
            oom_memory_reserve: 14,
        }
    }

    fn run(hours: u64) -> RunRecord {
        RunRecord::new(Walltime::from_hours(hours))
    }

    #[test]
    fn test_converged_and_fatal() {
        let params = fixtures::stage_parameters();
        assert_eq!(decide(&Diagnostic::Converged, &run(1), &params, 4, &policy()), RetryDecision::Accept);
        let fatal = Diagnostic::NumericalErrorFatal {
            pattern: "BRMIX".to_string(),
        };
        assert!(matches!(
            decide(&fatal, &run(1), &params, 4, &policy()),
            RetryDecision::Fail(msg) if msg.contains("BRMIX")
        ));
    }

    #[test]
    fn test_walltime_doubles_to_ceiling() {
        let params = fixtures::stage_parameters();
        let decision = decide(&Diagnostic::WalltimeExceeded, &run(3), &params, 4, &policy());
        assert_eq!(
            decision,
            RetryDecision::Continue {
                walltime: Walltime::from_hours(6),
                remediation: None,
                crashed: false
            }
        );
        let decision = decide(&Diagnostic::WalltimeExceeded, &run(6), &params, 4, &policy());
        assert!(matches!(decision, RetryDecision::Continue { walltime, .. } if walltime == Walltime::from_hours(8)));
    }

    #[test]
    fn test_cap_fails_on_next_occurrence() {
        let params = fixtures::stage_parameters();
        let mut r = run(1);
        r.retry_count = 2;
        assert!(matches!(
            decide(&Diagnostic::UnconvergedContinue, &r, &params, 4, &policy()),
            RetryDecision::Continue { .. }
        ));
        r.retry_count = 3;
        assert!(matches!(
            decide(&Diagnostic::UnconvergedContinue, &r, &params, 4, &policy()),
            RetryDecision::Fail(_)
        ));
    }

    #[test]
    fn test_crash_retried_once() {
        let params = fixtures::stage_parameters();
        let mut r = run(1);
        assert!(matches!(
            decide(&Diagnostic::CrashedUnknown, &r, &params, 4, &policy()),
            RetryDecision::Continue { crashed: true, .. }
        ));
        r.crash_count = 1;
        assert!(matches!(
            decide(&Diagnostic::CrashedUnknown, &r, &params, 4, &policy()),
            RetryDecision::Fail(_)
        ));
    }

    #[test]
    fn test_remediations_are_one_shot() {
        let mut params = fixtures::stage_parameters();
        let subspace = Diagnostic::NumericalErrorRecoverable {
            error: RecoverableError::SubspaceMatrix,
        };
        assert!(matches!(
            decide(&subspace, &run(1), &params, 4, &policy()),
            RetryDecision::Continue { remediation: Some(Remediation::AlgoFast), .. }
        ));
        params.algo = "Fast".to_string();
        assert!(matches!(decide(&subspace, &run(1), &params, 4, &policy()), RetryDecision::Fail(_)));

        let oom = Diagnostic::NumericalErrorRecoverable {
            error: RecoverableError::OutOfMemory,
        };
        assert!(matches!(
            decide(&oom, &run(1), &params, 4, &policy()),
            RetryDecision::Continue {
                remediation: Some(Remediation::MemoryReserve { cores_per_node: 14 }),
                ..
            }
        ));
        assert!(matches!(decide(&oom, &run(1), &params, 14, &policy()), RetryDecision::Fail(_)));

        let bravais = Diagnostic::NumericalErrorRecoverable {
            error: RecoverableError::InconsistentBravais,
        };
        params.symprec = Some(TIGHT_SYMPREC);
        assert!(matches!(decide(&bravais, &run(1), &params, 4, &policy()), RetryDecision::Fail(_)));
    }
}
