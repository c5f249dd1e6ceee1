//! Classification of a finished run from its output logs.
//!
//! Every pattern that matches produces a candidate; the candidate with the
//! best [`Diagnostic::priority`] wins. Priority is total:
//!
//! 1. numerical-error-fatal (pattern table order)
//! 2. numerical-error-recoverable (sub-space, Bravais, memory)
//! 3. converged
//! 4. walltime-exceeded
//! 5. unconverged-continue
//! 6. crashed-unknown

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Numerical errors that a single parameter change can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverableError {
    /// Sub-space matrix diagonalisation failed.
    SubspaceMatrix,
    /// Symmetry detection disagrees with the lattice.
    InconsistentBravais,
    /// The job was killed for exceeding memory.
    OutOfMemory,
}

impl fmt::Display for RecoverableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubspaceMatrix => write!(f, "sub_space_matrix"),
            Self::InconsistentBravais => write!(f, "inconsistent_bravais"),
            Self::OutOfMemory => write!(f, "out_of_memory"),
        }
    }
}

/// Classification of a run that has left the scheduler queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The run reached its convergence marker.
    Converged,
    /// The run ended cleanly short of convergence.
    UnconvergedContinue,
    /// The scheduler killed the run at its walltime.
    WalltimeExceeded,
    /// A numerical error with a known remediation.
    NumericalErrorRecoverable {
        /// Which error was seen.
        error: RecoverableError,
    },
    /// A numerical error nothing automatic can fix.
    NumericalErrorFatal {
        /// The matched log pattern.
        pattern: String,
    },
    /// Output exists but explains nothing.
    CrashedUnknown,
}

impl Diagnostic {
    /// Sort key; lower wins when several diagnostics match one log.
    #[must_use]
    pub fn priority(&self) -> (u8, u8) {
        match self {
            Self::NumericalErrorFatal { pattern } => {
                let index = FATAL_PATTERNS
                    .iter()
                    .position(|p| p.text == pattern)
                    .unwrap_or(FATAL_PATTERNS.len());
                (0, u8::try_from(index).unwrap_or(u8::MAX))
            }
            Self::NumericalErrorRecoverable { error } => (1, *error as u8),
            Self::Converged => (2, 0),
            Self::WalltimeExceeded => (3, 0),
            Self::UnconvergedContinue => (4, 0),
            Self::CrashedUnknown => (5, 0),
        }
    }

    /// Short label used in logs and events.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Converged => "converged".to_string(),
            Self::UnconvergedContinue => "unconverged_continue".to_string(),
            Self::WalltimeExceeded => "walltime_exceeded".to_string(),
            Self::NumericalErrorRecoverable { error } => format!("recoverable:{error}"),
            Self::NumericalErrorFatal { pattern } => format!("fatal:{pattern}"),
            Self::CrashedUnknown => "crashed_unknown".to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Which convergence marker a run is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceRule {
    /// Ionic relaxation: needs "reached required accuracy".
    IonicRelaxation,
    /// Fixed-ion run: needs a final `F=` energy line.
    SinglePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogSource {
    Stdout,
    Stderr,
}

struct FatalPattern {
    text: &'static str,
    source: LogSource,
    single_point_only: bool,
}

const fn fatal(text: &'static str, source: LogSource) -> FatalPattern {
    FatalPattern {
        text,
        source,
        single_point_only: false,
    }
}

const FATAL_PATTERNS: [FatalPattern; 9] = [
    fatal("VERY BAD NEWS", LogSource::Stdout),
    fatal("Fatal error", LogSource::Stdout),
    fatal("SICK JOB", LogSource::Stdout),
    fatal("BRMIX", LogSource::Stdout),
    fatal("num prob", LogSource::Stdout),
    fatal("SETYLM", LogSource::Stderr),
    fatal("Segmentation", LogSource::Stderr),
    fatal("command not found", LogSource::Stderr),
    FatalPattern {
        text: "NELM",
        source: LogSource::Stdout,
        single_point_only: true,
    },
];

const RECOVERABLE_PATTERNS: [(&str, LogSource, RecoverableError); 3] = [
    ("Sub-Space-Matrix", LogSource::Stdout, RecoverableError::SubspaceMatrix),
    ("Inconsistent Bravais", LogSource::Stdout, RecoverableError::InconsistentBravais),
    ("oom-kill", LogSource::Stderr, RecoverableError::OutOfMemory),
];

const RELAXATION_MARKER: &str = "reached required accuracy";
const WALLTIME_MARKER: &str = "DUE TO TIME LIMIT";

#[allow(clippy::expect_used)]
static ENERGY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+\s+F=\s*\S+").expect("valid energy line pattern"));

/// Text of the two logs a run leaves behind.
#[derive(Debug, Clone, Default)]
pub struct RunLogs {
    /// Simulation standard output; `None` if the file does not exist yet.
    pub stdout: Option<String>,
    /// Standard error; `None` if the file does not exist yet.
    pub stderr: Option<String>,
}

impl RunLogs {
    /// Creates logs from in-memory text.
    #[must_use]
    pub fn new(stdout: Option<String>, stderr: Option<String>) -> Self {
        Self { stdout, stderr }
    }

    /// The last `n` lines of stdout, for failure reports.
    #[must_use]
    pub fn stdout_tail(&self, n: usize) -> String {
        let Some(stdout) = &self.stdout else {
            return String::new();
        };
        let lines: Vec<&str> = stdout.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }

    fn text(&self, source: LogSource) -> &str {
        match source {
            LogSource::Stdout => self.stdout.as_deref().unwrap_or_default(),
            LogSource::Stderr => self.stderr.as_deref().unwrap_or_default(),
        }
    }
}

/// Classifies the logs of a run that is no longer in the queue.
///
/// Returns `None` when stdout does not exist yet, which the caller treats
/// as a filesystem that has not caught up with the scheduler.
#[must_use]
pub fn diagnose(logs: &RunLogs, rule: ConvergenceRule) -> Option<Diagnostic> {
    let stdout = logs.stdout.as_deref()?;

    let mut candidates = Vec::new();
    for pattern in &FATAL_PATTERNS {
        if pattern.single_point_only && rule != ConvergenceRule::SinglePoint {
            continue;
        }
        if logs.text(pattern.source).contains(pattern.text) {
            candidates.push(Diagnostic::NumericalErrorFatal {
                pattern: pattern.text.to_string(),
            });
        }
    }
    for (text, source, error) in RECOVERABLE_PATTERNS {
        if logs.text(source).contains(text) {
            candidates.push(Diagnostic::NumericalErrorRecoverable { error });
        }
    }

    let converged = match rule {
        ConvergenceRule::IonicRelaxation => stdout.contains(RELAXATION_MARKER),
        ConvergenceRule::SinglePoint => ENERGY_LINE.is_match(stdout),
    };
    if converged {
        candidates.push(Diagnostic::Converged);
    }
    if logs.text(LogSource::Stderr).contains(WALLTIME_MARKER) {
        candidates.push(Diagnostic::WalltimeExceeded);
    }
    if !stdout.trim().is_empty() && rule == ConvergenceRule::IonicRelaxation {
        candidates.push(Diagnostic::UnconvergedContinue);
    }
    candidates.push(Diagnostic::CrashedUnknown);

    candidates.into_iter().min_by_key(Diagnostic::priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn logs(stdout: &str, stderr: &str) -> RunLogs {
        RunLogs::new(Some(stdout.to_string()), Some(stderr.to_string()))
    }

    #[test]
    fn test_missing_stdout_is_not_diagnosable() {
        let logs = RunLogs::new(None, Some(String::new()));
        assert_eq!(diagnose(&logs, ConvergenceRule::SinglePoint), None);
    }

    #[test]
    fn test_relaxation_converged() {
        let out = "DAV: 1\n  10 F= -.1E+02 E0= -.1E+02\n reached required accuracy - stopping\n";
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::Converged)
        );
    }

    #[test]
    fn test_relaxation_unconverged() {
        let out = "DAV: 1\n   3 F= -.1E+02 E0= -.1E+02\n";
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::UnconvergedContinue)
        );
    }

    #[test]
    fn test_single_point_without_energy_is_crash() {
        assert_eq!(
            diagnose(&logs("running on 32 nodes\n", ""), ConvergenceRule::SinglePoint),
            Some(Diagnostic::CrashedUnknown)
        );
        assert_eq!(
            diagnose(&logs("", ""), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::CrashedUnknown)
        );
    }

    #[test]
    fn test_walltime_beats_unconverged() {
        let err = "slurmstepd: error: *** JOB 42 ON n01 CANCELLED AT 2024-01-01 DUE TO TIME LIMIT ***";
        assert_eq!(
            diagnose(&logs("   2 F= -1.0\n", err), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::WalltimeExceeded)
        );
    }

    #[test]
    fn test_converged_beats_walltime() {
        let err = "*** JOB 42 CANCELLED DUE TO TIME LIMIT ***";
        assert_eq!(
            diagnose(&logs("   1 F= -1.0 E0= -1.0\n", err), ConvergenceRule::SinglePoint),
            Some(Diagnostic::Converged)
        );
    }

    #[test]
    fn test_fatal_beats_recoverable_and_converged() {
        let out = "WARNING: Sub-Space-Matrix is not hermitian\nVERY BAD NEWS! internal error\n reached required accuracy\n";
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::NumericalErrorFatal {
                pattern: "VERY BAD NEWS".to_string()
            })
        );
    }

    #[test]
    fn test_recoverable_beats_converged() {
        let out = "Sub-Space-Matrix is not hermitian in DAV\n   1 F= -1.0\n";
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::SinglePoint),
            Some(Diagnostic::NumericalErrorRecoverable {
                error: RecoverableError::SubspaceMatrix
            })
        );
    }

    #[test]
    fn test_recoverable_order_is_fixed() {
        let out = "ERROR: Inconsistent Bravais lattice\n";
        let err = "slurmstepd: error: Detected 1 oom-kill event(s)";
        assert_eq!(
            diagnose(&logs(out, err), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::NumericalErrorRecoverable {
                error: RecoverableError::InconsistentBravais
            })
        );
        assert_eq!(
            diagnose(&logs("x\n", err), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::NumericalErrorRecoverable {
                error: RecoverableError::OutOfMemory
            })
        );
    }

    #[test]
    fn test_nelm_only_fatal_for_single_point() {
        let out = "NELM reached\n   1 F= -1.0\n";
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::SinglePoint),
            Some(Diagnostic::NumericalErrorFatal {
                pattern: "NELM".to_string()
            })
        );
        assert_eq!(
            diagnose(&logs(out, ""), ConvergenceRule::IonicRelaxation),
            Some(Diagnostic::UnconvergedContinue)
        );
    }

    #[test]
    fn test_priority_is_total() {
        let all = vec![
            Diagnostic::CrashedUnknown,
            Diagnostic::UnconvergedContinue,
            Diagnostic::WalltimeExceeded,
            Diagnostic::Converged,
            Diagnostic::NumericalErrorRecoverable {
                error: RecoverableError::OutOfMemory,
            },
            Diagnostic::NumericalErrorRecoverable {
                error: RecoverableError::SubspaceMatrix,
            },
            Diagnostic::NumericalErrorFatal {
                pattern: "BRMIX".to_string(),
            },
            Diagnostic::NumericalErrorFatal {
                pattern: "VERY BAD NEWS".to_string(),
            },
        ];
        let mut keys: Vec<_> = all.iter().map(Diagnostic::priority).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), all.len());
    }

    #[test]
    fn test_stdout_tail() {
        let logs = logs("a\nb\nc\nd\n", "");
        assert_eq!(logs.stdout_tail(2), "c\nd");
        assert_eq!(logs.stdout_tail(10), "a\nb\nc\nd");
    }

    #[test]
    fn test_serde_shape() {
        let diag = Diagnostic::NumericalErrorRecoverable {
            error: RecoverableError::OutOfMemory,
        };
        assert_eq!(
            serde_json::to_value(&diag).unwrap(),
            serde_json::json!({"kind": "numerical_error_recoverable", "error": "out_of_memory"})
        );
    }
}
