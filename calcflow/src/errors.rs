//! Error types for calcflow.
//!
//! The taxonomy follows how far an error is allowed to travel: configuration
//! errors sink a single material, submission errors are retried on the next
//! poll, deck and analysis errors fail a single stage.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// The main error type for calcflow operations.
#[derive(Debug, Error)]
pub enum CalcflowError {
    /// Missing or invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The scheduler rejected a submission.
    #[error("{0}")]
    Submission(#[from] SubmissionError),

    /// A scheduler status or cancel command failed.
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    /// Input files could not be rendered.
    #[error("{0}")]
    Deck(#[from] DeckError),

    /// A structure file could not be read.
    #[error("{0}")]
    Structure(#[from] StructureError),

    /// Outputs could not be turned into a result record.
    #[error("{0}")]
    Analysis(#[from] AnalysisError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T, E = CalcflowError> = std::result::Result<T, E>;

/// Error raised when a configuration document is missing or invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The document the error came from, when known.
    pub path: Option<PathBuf>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    /// Attaches the offending document path and prefixes it to the message.
    #[must_use]
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        self.message = format!("{}: {}", path.display(), self.message);
        self.path = Some(path.to_path_buf());
        self
    }
}

/// Error raised when the scheduler refuses a job.
///
/// Transient: the stage keeps its state and the submission is attempted
/// again on the next poll.
#[derive(Debug, Clone, Error)]
#[error("{command}: {message}")]
pub struct SubmissionError {
    /// The command that was run.
    pub command: String,
    /// What went wrong.
    pub message: String,
}

impl SubmissionError {
    /// Creates a new submission error.
    #[must_use]
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Errors from scheduler status and cancel commands.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The command could not be started.
    #[error("Could not execute '{0}': {1}")]
    SpawnProcess(String, #[source] std::io::Error),

    /// The command exited with a failure status.
    #[error("'{command}' failed ({status}): {stderr}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// Exit description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The command printed something that could not be parsed.
    #[error("Unexpected output from {0}: {1}")]
    UnexpectedOutput(String, String),
}

/// Errors from rendering an input deck or job script.
#[derive(Debug, Clone, Error)]
pub enum DeckError {
    /// No pseudopotential is available for an element.
    #[error("No pseudopotential available for element '{0}'")]
    MissingPseudopotential(String),

    /// A pseudopotential file carries no ZVAL entry.
    #[error("Pseudopotential for '{0}' has no ZVAL")]
    MissingValence(String),

    /// The structure cannot be used for this deck.
    #[error("Malformed structure: {0}")]
    MalformedStructure(String),

    /// The job script template names a placeholder nobody fills.
    #[error("Unknown placeholder '{{{0}}}' in job script template")]
    UnknownPlaceholder(String),

    /// A stage parameter has a value the deck cannot express.
    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter {
        /// The parameter name.
        name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Error raised when a POSCAR-format structure cannot be parsed.
#[derive(Debug, Clone, Error)]
#[error("Invalid structure file: {message}")]
pub struct StructureError {
    /// What the reader or writer rejected.
    pub message: String,
}

impl StructureError {
    /// Creates a new structure error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised when a finished run does not yield a complete result.
#[derive(Debug, Clone, Error)]
#[error("{stage}: {message}")]
pub struct AnalysisError {
    /// The stage whose outputs were parsed.
    pub stage: String,
    /// What could not be extracted.
    pub message: String,
}

impl AnalysisError {
    /// Creates a new analysis error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
