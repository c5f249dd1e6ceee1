//! Workflow events.
//!
//! The engine reports every stage transition as a [`WorkflowEvent`] to the
//! [`EventSink`] it was built with.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StageKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A job was accepted by the scheduler.
    #[serde(rename = "stage.submitted")]
    StageSubmitted,
    /// A stage finished and its result was recorded.
    #[serde(rename = "stage.converged")]
    StageConverged,
    /// A run is being resubmitted.
    #[serde(rename = "stage.retry")]
    StageRetry,
    /// A stage gave up.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage was halted by the stop sentinel.
    #[serde(rename = "stage.stopped")]
    StageStopped,
    /// A weakly magnetic relaxation is being redone without spin.
    #[serde(rename = "stage.spin_override")]
    StageSpinOverride,
    /// One strained sub-run converged.
    #[serde(rename = "substage.converged")]
    SubstageConverged,
    /// One strained sub-run failed.
    #[serde(rename = "substage.failed")]
    SubstageFailed,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StageSubmitted => "stage.submitted",
            Self::StageConverged => "stage.converged",
            Self::StageRetry => "stage.retry",
            Self::StageFailed => "stage.failed",
            Self::StageStopped => "stage.stopped",
            Self::StageSpinOverride => "stage.spin_override",
            Self::SubstageConverged => "substage.converged",
            Self::SubstageFailed => "substage.failed",
        }
    }
}

/// One transition of one stage of one material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Material name.
    pub material: String,
    /// Stage kind, if the event concerns one.
    pub stage: Option<StageKind>,
    /// Event-specific fields.
    pub data: Value,
}

impl WorkflowEvent {
    /// Creates an event with no data.
    #[must_use]
    pub fn new(kind: EventKind, material: impl Into<String>) -> Self {
        Self {
            kind,
            material: material.into(),
            stage: None,
            data: Value::Null,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the event data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_dotted_type() {
        let event = WorkflowEvent::new(EventKind::StageRetry, "NaCl")
            .with_stage(StageKind::Relax)
            .with_data(json!({"retry_count": 2}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stage.retry");
        assert_eq!(value["stage"], "relax");
        assert_eq!(value["data"]["retry_count"], 2);
    }
}
