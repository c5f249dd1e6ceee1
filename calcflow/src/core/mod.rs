//! Core types shared by every layer: stage kinds and states, walltimes,
//! and the diagnostic classifier.

mod diagnostic;
mod status;
mod walltime;

pub use diagnostic::{diagnose, ConvergenceRule, Diagnostic, RecoverableError, RunLogs};
pub use status::{MaterialStatus, StageKind, StageState};
pub use walltime::Walltime;

/// File names shared by the deck builder, the state machine and the analyzers.
pub mod files {
    /// Input structure.
    pub const POSCAR: &str = "POSCAR";
    /// Final structure written by the simulation.
    pub const CONTCAR: &str = "CONTCAR";
    /// Concatenated pseudopotentials.
    pub const POTCAR: &str = "POTCAR";
    /// Parameter card.
    pub const INCAR: &str = "INCAR";
    /// Explicit k-point grid.
    pub const KPOINTS: &str = "KPOINTS";
    /// Detailed simulation output.
    pub const OUTCAR: &str = "OUTCAR";
    /// Batch script.
    pub const JOB_SCRIPT: &str = "vasp.q";
    /// Simulation standard output.
    pub const STDOUT: &str = "stdout.txt";
    /// Simulation standard error.
    pub const STDERR: &str = "stderr.txt";
    /// Persisted stage record.
    pub const STAGE_RECORD: &str = "stage.json";
    /// Per-directory parameter overrides.
    pub const OVERRIDES: &str = "overrides.json";
}
