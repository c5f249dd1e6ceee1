//! Stage parameters and their layered resolution.
//!
//! Precedence, lowest first: the global `calc_config.json`, the
//! material's `overrides.json`, the stage directory's `overrides.json`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use super::read_json_file;
use crate::core::{ConvergenceRule, StageKind, Walltime};
use crate::errors::ConfigError;

/// A partial parameter object, keyed by lower-case tag name.
pub type ParameterLayer = Map<String, Value>;

/// Stage kind → parameter object. Used for the global document and for
/// per-material overrides, which share its shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalcConfig {
    stages: BTreeMap<StageKind, ParameterLayer>,
}

impl CalcConfig {
    /// Builds a config from an already parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(object) = value else {
            return Err(ConfigError::new("expected an object keyed by stage kind"));
        };
        let mut stages = BTreeMap::new();
        for (key, layer) in object {
            let kind: StageKind = key.parse()?;
            let Value::Object(layer) = layer else {
                return Err(ConfigError::new(format!(
                    "parameters for '{key}' must be an object"
                )));
            };
            stages.insert(kind, normalize_keys(layer));
        }
        Ok(Self { stages })
    }

    /// Loads a config document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let value: Value = read_json_file(path)?;
        Self::from_value(value).map_err(|e| e.with_path(path))
    }

    /// Parameters given for one stage kind.
    #[must_use]
    pub fn layer(&self, kind: StageKind) -> Option<&ParameterLayer> {
        self.stages.get(&kind)
    }

    /// Sets the parameters of one stage kind.
    #[must_use]
    pub fn with_layer(mut self, kind: StageKind, layer: ParameterLayer) -> Self {
        self.stages.insert(kind, normalize_keys(layer));
        self
    }
}

fn normalize_keys(layer: ParameterLayer) -> ParameterLayer {
    layer
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

/// How k-points are chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KPointPolicy {
    /// Maximum reciprocal-space spacing, written as the KSPACING tag.
    Spacing(f64),
    /// k-points per reciprocal atom, written as an explicit Gamma-centred grid.
    Density(u32),
}

/// Fully resolved, validated parameters for one stage.
///
/// Immutable once resolved; the stage's walltime lives on its run record
/// so that retries can double it without touching this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParameters {
    /// Initial walltime request.
    pub walltime: Walltime,
    /// PREC tag.
    #[serde(default = "default_prec")]
    pub prec: String,
    /// Plane-wave cutoff in eV.
    pub encut: f64,
    /// Electronic convergence threshold.
    pub ediff: f64,
    /// Ionic convergence threshold.
    #[serde(default)]
    pub ediffg: Option<f64>,
    /// Electronic minimisation algorithm.
    #[serde(default = "default_algo")]
    pub algo: String,
    /// Electronic step limit.
    #[serde(default)]
    pub nelm: Option<u32>,
    /// Smearing method.
    #[serde(default)]
    pub ismear: i32,
    /// Smearing width in eV.
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Ionic algorithm; -1 keeps ions fixed.
    #[serde(default = "default_ibrion")]
    pub ibrion: i32,
    /// Which degrees of freedom relax.
    #[serde(default)]
    pub isif: Option<u32>,
    /// Ionic step limit.
    #[serde(default)]
    pub nsw: u32,
    /// Ionic step size.
    #[serde(default)]
    pub potim: Option<f64>,
    /// Real-space projection.
    #[serde(default)]
    pub lreal: Option<String>,
    /// Symmetry tolerance.
    #[serde(default)]
    pub symprec: Option<f64>,
    /// Displacements per direction for finite differences.
    #[serde(default)]
    pub nfree: Option<u32>,
    /// k-point spacing in 1/Å.
    #[serde(default)]
    pub kspacing: Option<f64>,
    /// k-points per reciprocal atom.
    #[serde(default)]
    pub kppra: Option<u32>,
    /// Initial magnetic moment per atom for spin-polarised runs.
    #[serde(default = "default_magmom")]
    pub magmom: f64,
    /// Any other tag, written verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_prec() -> String {
    "Accurate".to_string()
}

fn default_algo() -> String {
    "Normal".to_string()
}

const fn default_sigma() -> f64 {
    0.05
}

const fn default_ibrion() -> i32 {
    -1
}

const fn default_magmom() -> f64 {
    5.0
}

impl StageParameters {
    /// The k-point policy; validation guarantees exactly one is set.
    #[must_use]
    pub fn k_point_policy(&self) -> KPointPolicy {
        match (self.kspacing, self.kppra) {
            (_, Some(kppra)) => KPointPolicy::Density(kppra),
            (Some(spacing), None) => KPointPolicy::Spacing(spacing),
            (None, None) => KPointPolicy::Spacing(DEFAULT_KSPACING),
        }
    }

    /// Which convergence marker a run with these parameters prints.
    #[must_use]
    pub fn convergence_rule(&self) -> ConvergenceRule {
        if self.nsw > 0 && (1..=3).contains(&self.ibrion) {
            ConvergenceRule::IonicRelaxation
        } else {
            ConvergenceRule::SinglePoint
        }
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("encut", Some(self.encut)),
            ("ediff", Some(self.ediff)),
            ("sigma", Some(self.sigma)),
            ("kspacing", self.kspacing),
            ("symprec", self.symprec),
            ("potim", self.potim),
        ];
        for (name, value) in positive {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(ConfigError::new(format!(
                        "{name} must be positive, got {v}"
                    )));
                }
            }
        }
        if self.kspacing.is_some() && self.kppra.is_some() {
            return Err(ConfigError::new("set either kspacing or kppra, not both"));
        }
        if self.kppra == Some(0) {
            return Err(ConfigError::new("kppra must be positive"));
        }
        Ok(())
    }
}

/// k-point spacing used when a stage names no policy.
pub const DEFAULT_KSPACING: f64 = 0.15;

/// Resolves the parameters of one stage from its three layers.
///
/// Keys are merged one by one, later layers winning, and the merged object
/// is then typed and validated. A stage kind missing from the global
/// document is a configuration error.
pub fn resolve_stage_parameters(
    kind: StageKind,
    global: &CalcConfig,
    material: Option<&CalcConfig>,
    stage: Option<&ParameterLayer>,
) -> Result<StageParameters, ConfigError> {
    let mut merged = global
        .layer(kind)
        .cloned()
        .ok_or_else(|| ConfigError::new(format!("no parameters configured for stage '{kind}'")))?;

    let layers = [material.and_then(|m| m.layer(kind)), stage];
    for layer in layers.into_iter().flatten() {
        for (key, value) in layer {
            merged.insert(key.to_ascii_lowercase(), value.clone());
        }
    }

    let params: StageParameters = serde_json::from_value(Value::Object(merged))
        .map_err(|e| ConfigError::new(format!("invalid parameters for stage '{kind}': {e}")))?;
    params
        .validate()
        .map_err(|e| ConfigError::new(format!("stage '{kind}': {}", e.message)))?;
    Ok(params)
}
