//! Configuration documents and their resolution.
//!
//! Everything here is loaded once per run and shared read-only afterwards.

mod computing;
mod params;
mod workflow;

pub use computing::SiteConfig;
pub use params::{
    resolve_stage_parameters, CalcConfig, KPointPolicy, ParameterLayer, StageParameters,
    DEFAULT_KSPACING,
};
pub use workflow::{
    default_bulk_modulus_strains, validate_bulk_modulus_strains, WorkflowConfig,
    BULK_STRAIN_BOUNDS,
};

use serde::de::DeserializeOwned;
use std::path::Path;

use crate::errors::ConfigError;

/// Global calculation settings, in the calculations directory.
pub const CALC_CONFIG_FILE: &str = "calc_config.json";
/// Computer settings, in the calculations directory.
pub const COMPUTING_CONFIG_FILE: &str = "computing_config.json";
/// Element to pseudopotential directory table, in the calculations directory.
pub const POTENTIAL_TABLE_FILE: &str = "pot_dict.json";
/// Workflow settings, in the calculations directory.
pub const WORKFLOW_CONFIG_FILE: &str = "workflow.json";

/// Reads and deserializes a JSON document.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("cannot read: {e}")).with_path(path))?;
    serde_json::from_str(&text)
        .map_err(|e| ConfigError::new(format!("invalid JSON: {e}")).with_path(path))
}

/// Reads a JSON document if the file exists.
pub fn read_optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if path.exists() {
        read_json_file(path).map(Some)
    } else {
        Ok(None)
    }
}
