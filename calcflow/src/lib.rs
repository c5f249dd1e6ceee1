//! # Calcflow
//!
//! Drives crystal structures through a fixed sequence of DFT stages on a
//! SLURM cluster.
//!
//! Each material lives in its own directory under a calculations root.
//! The driver is run periodically; every run is one polling pass:
//!
//! - **Stage state machine**: each stage moves by at most one transition
//!   per pass, persisted to `stage.json` in its directory
//! - **Retry table**: walltime, unconverged and numerical failures map to
//!   continuations with escalated walltime or a one-shot remediation
//! - **Strained sub-stages**: bulk-modulus and elastic stages fan out into
//!   deformed runs and fit an equation of state or a stiffness tensor
//! - **Stop sentinel**: a `STOP` file cancels a material's jobs and halts it
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use calcflow::prelude::*;
//!
//! let ctx = WorkflowContext::load("calcs", WorkflowConfig::default())?;
//! let store = Arc::new(FsStore::new("calcs", "STOP"));
//! let engine = Engine::new(Arc::new(ctx), store, Arc::new(SlurmScheduler::new()));
//! let document = engine.run().await?;
//! println!("{}", document.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod analysis;
pub mod config;
pub mod core;
pub mod deck;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod results;
pub mod scheduler;
pub mod script;
pub mod structure;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::analysis::{EosFit, StageResult};
    pub use crate::config::{CalcConfig, SiteConfig, StageParameters, WorkflowConfig};
    pub use crate::core::{Diagnostic, MaterialStatus, StageKind, StageState, Walltime};
    pub use crate::engine::{Engine, FsStore, MaterialStore, StageRecord, WorkflowContext};
    pub use crate::errors::{CalcflowError, ConfigError, Result};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_logging, LogConfig};
    pub use crate::results::{MaterialReport, ResultsDocument, Summary};
    pub use crate::scheduler::{JobId, JobStatus, Scheduler, SlurmScheduler};
    pub use crate::structure::Structure;
}
