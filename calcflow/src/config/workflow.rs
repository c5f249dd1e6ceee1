//! Run-wide workflow settings.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::read_json_file;
use crate::core::{StageKind, Walltime};
use crate::errors::ConfigError;

/// Volume strains allowed for bulk-modulus sub-runs.
pub const BULK_STRAIN_BOUNDS: (f64, f64) = (0.8, 1.2);

/// Settings that apply to every material of a run.
///
/// Read from the optional `workflow.json`; command-line flags override
/// individual fields through the `with_*` builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Stages to run, in any order.
    pub stages: Vec<StageKind>,
    /// Materials processed concurrently.
    pub workers: usize,
    /// Retries allowed per stage (and per sub-stage) before it fails.
    pub max_retries: u32,
    /// Ceiling for walltime doubling.
    pub max_walltime: Walltime,
    /// Relaxations below this |moment| per atom are redone without spin.
    pub magmom_per_atom_cutoff: Option<f64>,
    /// Relative volume change that sends a relax back for another pass.
    pub relax_volume_tolerance: f64,
    /// Linear scale factors for bulk-modulus sub-runs.
    pub bulk_modulus_strains: Vec<f64>,
    /// Strain magnitudes for elastic sub-runs; each is applied with both signs.
    pub elastic_strains: Vec<f64>,
    /// Stdout lines logged when a run fails.
    pub tail_lines: usize,
    /// Submit jobs; when false decks are rendered but left unsubmitted.
    pub submit: bool,
    /// Name of the per-material stop sentinel.
    pub stop_file: String,
    /// Name of the results aggregate in the calculations directory.
    pub results_file: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stages: StageKind::ALL.to_vec(),
            workers: 4,
            max_retries: 3,
            max_walltime: Walltime::from_hours(48),
            magmom_per_atom_cutoff: None,
            relax_volume_tolerance: 0.05,
            bulk_modulus_strains: default_bulk_modulus_strains(),
            elastic_strains: vec![0.01],
            tail_lines: 5,
            submit: true,
            stop_file: "STOP".to_string(),
            results_file: "results.json".to_string(),
        }
    }
}

/// Eleven volume strains from 0.925 to 1.075, as linear scale factors.
#[must_use]
pub fn default_bulk_modulus_strains() -> Vec<f64> {
    (0..11)
        .map(|i| {
            let volume = (0.925 + 0.015 * f64::from(i)) * 1e6;
            (volume.round() / 1e6).cbrt()
        })
        .collect()
}

impl WorkflowConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `workflow.json`, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            read_json_file(path)?
        } else {
            Self::default()
        };
        config.validate().map_err(|e| e.with_path(path))?;
        Ok(config)
    }

    /// Sets the stages to run.
    #[must_use]
    pub fn with_stages(mut self, stages: &[StageKind]) -> Self {
        self.stages = stages.to_vec();
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the per-stage retry cap.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the walltime ceiling.
    #[must_use]
    pub fn with_max_walltime(mut self, walltime: Walltime) -> Self {
        self.max_walltime = walltime;
        self
    }

    /// Sets the spin cutoff.
    #[must_use]
    pub fn with_magmom_cutoff(mut self, cutoff: f64) -> Self {
        self.magmom_per_atom_cutoff = Some(cutoff);
        self
    }

    /// Sets the bulk-modulus strains.
    #[must_use]
    pub fn with_bulk_modulus_strains(mut self, strains: Vec<f64>) -> Self {
        self.bulk_modulus_strains = strains;
        self
    }

    /// Sets the elastic strain magnitudes.
    #[must_use]
    pub fn with_elastic_strains(mut self, strains: Vec<f64>) -> Self {
        self.elastic_strains = strains;
        self
    }

    /// Enables or disables submission.
    #[must_use]
    pub fn with_submit(mut self, submit: bool) -> Self {
        self.submit = submit;
        self
    }

    /// The configured stages in workflow order.
    #[must_use]
    pub fn ordered_stages(&self) -> Vec<StageKind> {
        StageKind::in_workflow_order(&self.stages)
    }

    /// Checks every field that has a constrained range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::new("no stages configured"));
        }
        if self.workers == 0 {
            return Err(ConfigError::new("workers must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.relax_volume_tolerance) {
            return Err(ConfigError::new("relax_volume_tolerance must be in [0, 1)"));
        }
        validate_bulk_modulus_strains(&self.bulk_modulus_strains)?;
        if self.elastic_strains.is_empty()
            || self
                .elastic_strains
                .iter()
                .any(|s| !(s.is_finite() && *s > 0.0 && *s <= 0.1))
        {
            return Err(ConfigError::new(
                "elastic_strains must be non-empty magnitudes in (0, 0.1]",
            ));
        }
        Ok(())
    }
}

/// Checks a bulk-modulus strain set: odd length of at least five (the fit
/// has four coefficients), unit middle value, everything within
/// [`BULK_STRAIN_BOUNDS`].
pub fn validate_bulk_modulus_strains(strains: &[f64]) -> Result<(), ConfigError> {
    if strains.len() < 5 || strains.len() % 2 == 0 {
        return Err(ConfigError::new(format!(
            "bulk_modulus_strains needs an odd count of at least 5, got {}",
            strains.len()
        )));
    }
    let (low, high) = BULK_STRAIN_BOUNDS;
    if let Some(bad) = strains.iter().find(|s| !(low..=high).contains(*s)) {
        return Err(ConfigError::new(format!(
            "bulk modulus strain {bad} outside [{low}, {high}]"
        )));
    }
    let middle = strains[strains.len() / 2];
    if (middle - 1.0).abs() > 1e-12 {
        return Err(ConfigError::new(format!(
            "middle bulk modulus strain must be 1.0, got {middle}"
        )));
    }
    Ok(())
}
