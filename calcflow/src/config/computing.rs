//! Per-computer resource settings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::read_json_file;
use crate::errors::ConfigError;

/// Resource settings of the selected computer.
///
/// `computing_config.json` names the computer in use and carries one
/// object per known computer:
///
/// ```json
/// {"computer": "quest", "quest": {"allocation": "p12345", "ncore": 4, ...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Name of the computer.
    #[serde(skip)]
    pub name: String,
    /// Account charged for jobs.
    #[serde(default)]
    pub allocation: Option<String>,
    /// Partition jobs go to.
    #[serde(default)]
    pub queue: Option<String>,
    /// NCORE tag; NBANDS is rounded up to a multiple of it.
    pub ncore: u32,
    /// Physical cores per node.
    pub ncore_per_node: u32,
    /// Root of the pseudopotential library.
    pub potcar_dir: PathBuf,
    /// Scheduler user name.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Node feature constraint.
    #[serde(default)]
    pub constraint: Option<String>,
    /// Extra node factor for sites with small nodes.
    #[serde(default = "default_node_multiplier")]
    pub node_multiplier: u32,
    /// Cores per node left idle to leave memory for the others.
    #[serde(default = "default_memory_reserve")]
    pub memory_reserve_per_node: u32,
    /// Reserve used after an out-of-memory kill; half the node by default.
    #[serde(default)]
    pub oom_memory_reserve_per_node: Option<u32>,
    /// Command that launches the simulation binary.
    #[serde(default = "default_run_command")]
    pub run_command: String,
    /// Shell lines placed before the run command.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Custom job-script template, relative to the calculations directory.
    #[serde(default)]
    pub script_template: Option<PathBuf>,
}

const fn default_node_multiplier() -> u32 {
    1
}

const fn default_memory_reserve() -> u32 {
    4
}

fn default_run_command() -> String {
    "srun vasp_std".to_string()
}

impl SiteConfig {
    /// Selects and validates the computer named by the document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(mut object) = value else {
            return Err(ConfigError::new("expected an object"));
        };
        let name = match object.get("computer") {
            Some(Value::String(name)) => name.clone(),
            _ => return Err(ConfigError::new("missing string key 'computer'")),
        };
        let site = object
            .remove(&name)
            .ok_or_else(|| ConfigError::new(format!("no settings for computer '{name}'")))?;

        let mut config: Self = serde_json::from_value(site)
            .map_err(|e| ConfigError::new(format!("invalid settings for '{name}': {e}")))?;
        config.name = name;
        config.validate()?;
        Ok(config)
    }

    /// Loads `computing_config.json`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let value: Value = read_json_file(path)?;
        Self::from_value(value).map_err(|e| e.with_path(path))
    }

    /// Reserve applied once an out-of-memory remediation is in effect.
    #[must_use]
    pub fn oom_memory_reserve(&self) -> u32 {
        self.oom_memory_reserve_per_node
            .unwrap_or(self.ncore_per_node / 2)
    }

    /// Checks that every job gets at least one task per node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncore == 0 || self.ncore_per_node == 0 {
            return Err(ConfigError::new(format!(
                "computer '{}': ncore and ncore_per_node must be positive",
                self.name
            )));
        }
        if self.node_multiplier == 0 {
            return Err(ConfigError::new(format!(
                "computer '{}': node_multiplier must be positive",
                self.name
            )));
        }
        let largest_reserve = self
            .memory_reserve_per_node
            .saturating_mul(2)
            .max(self.oom_memory_reserve());
        if largest_reserve >= self.ncore_per_node {
            return Err(ConfigError::new(format!(
                "computer '{}': memory reserve {largest_reserve} leaves no cores on a {}-core node",
                self.name, self.ncore_per_node
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_selects_named_computer() {
        let site = SiteConfig::from_value(json!({
            "computer": "quest",
            "quest": {"allocation": "p31151", "queue": "normal", "ncore": 4,
                      "ncore_per_node": 28, "potcar_dir": "/projects/potcars",
                      "node_multiplier": 2},
            "perlmutter": {"ncore": "bad"}
        }))
        .unwrap();
        assert_eq!(site.name, "quest");
        assert_eq!(site.allocation.as_deref(), Some("p31151"));
        assert_eq!(site.node_multiplier, 2);
        assert_eq!(site.memory_reserve_per_node, 4);
        assert_eq!(site.oom_memory_reserve(), 14);
        assert_eq!(site.run_command, "srun vasp_std");
    }

    #[test]
    fn test_missing_computer_settings() {
        let err = SiteConfig::from_value(json!({"computer": "bridges"})).unwrap_err();
        assert!(err.message.contains("bridges"));
        assert!(SiteConfig::from_value(json!({"quest": {}})).is_err());
    }

    #[test]
    fn test_reserve_must_leave_cores() {
        let err = SiteConfig::from_value(json!({
            "computer": "tiny",
            "tiny": {"ncore": 1, "ncore_per_node": 8, "potcar_dir": "/p",
                     "memory_reserve_per_node": 4}
        }))
        .unwrap_err();
        assert!(err.message.contains("leaves no cores"));
    }
}
