//! Pseudopotential lookup table.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::config::read_optional_json;
use crate::errors::{ConfigError, DeckError};

#[allow(clippy::expect_used)]
static ZVAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ZVAL\s*=\s*([0-9]*\.?[0-9]+)").expect("valid ZVAL pattern"));

/// One element's pseudopotential.
#[derive(Debug, Clone, PartialEq)]
pub struct Pseudopotential {
    /// Directory name inside the library, e.g. `Na_pv`.
    pub label: String,
    /// Full POTCAR text.
    pub text: String,
    /// Valence electron count.
    pub zval: f64,
}

impl Pseudopotential {
    /// Parses a single-element POTCAR.
    pub fn parse(element: &str, label: &str, text: String) -> Result<Self, DeckError> {
        let zval = ZVAL
            .captures(&text)
            .and_then(|c| c[1].parse::<f64>().ok())
            .ok_or_else(|| DeckError::MissingValence(element.to_string()))?;
        Ok(Self {
            label: label.to_string(),
            text,
            zval,
        })
    }
}

/// Element → pseudopotential, loaded once per run and shared by all
/// workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PseudopotentialTable {
    entries: BTreeMap<String, Pseudopotential>,
}

impl PseudopotentialTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an element.
    #[must_use]
    pub fn with_entry(mut self, element: impl Into<String>, potential: Pseudopotential) -> Self {
        self.entries.insert(element.into(), potential);
        self
    }

    /// Looks up an element.
    pub fn get(&self, element: &str) -> Result<&Pseudopotential, DeckError> {
        self.entries
            .get(element)
            .ok_or_else(|| DeckError::MissingPseudopotential(element.to_string()))
    }

    /// Number of loaded elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads `<potcar_dir>/<label>/POTCAR` for each element.
    ///
    /// `pot_dict.json` maps elements to labels; elements it does not name
    /// use their own symbol. Elements whose file is missing or unreadable
    /// are left out with a warning, so only materials containing them fail.
    pub fn load(
        potcar_dir: &Path,
        table_path: &Path,
        elements: &BTreeSet<String>,
    ) -> Result<Self, ConfigError> {
        let labels: BTreeMap<String, String> = read_optional_json(table_path)?.unwrap_or_default();
        let mut table = Self::new();
        for element in elements {
            let label = labels.get(element).map_or(element.as_str(), String::as_str);
            let path = potcar_dir.join(label).join("POTCAR");
            let loaded = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    Pseudopotential::parse(element, label, text).map_err(|e| e.to_string())
                });
            match loaded {
                Ok(potential) => {
                    table.entries.insert(element.clone(), potential);
                }
                Err(error) => {
                    tracing::warn!(
                        element = %element,
                        path = %path.display(),
                        error = %error,
                        "Pseudopotential unavailable"
                    );
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn potcar(label: &str, zval: f64) -> String {
        format!("  PAW_PBE {label} 06Sep2000\n   POMASS =   22.990; ZVAL   =    {zval:.3}    mass and valenz\n End of Dataset\n")
    }

    #[test]
    fn test_parse_zval() {
        let p = Pseudopotential::parse("Na", "Na_pv", potcar("Na_pv", 7.0)).unwrap();
        assert_eq!(p.zval, 7.0);
        assert!(Pseudopotential::parse("X", "X", "no valence here".to_string()).is_err());
    }

    #[test]
    fn test_load_uses_mapping_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("potpaw");
        std::fs::create_dir_all(lib.join("Na_pv")).unwrap();
        std::fs::write(lib.join("Na_pv/POTCAR"), potcar("Na_pv", 7.0)).unwrap();
        std::fs::create_dir_all(lib.join("Cl")).unwrap();
        std::fs::write(lib.join("Cl/POTCAR"), potcar("Cl", 7.0)).unwrap();

        let table_path = dir.path().join("pot_dict.json");
        std::fs::write(&table_path, r#"{"Na": "Na_pv"}"#).unwrap();

        let elements: BTreeSet<String> =
            ["Na", "Cl", "Xe"].iter().map(|s| (*s).to_string()).collect();
        let table = PseudopotentialTable::load(&lib, &table_path, &elements).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("Na").unwrap().label, "Na_pv");
        assert_eq!(table.get("Cl").unwrap().label, "Cl");
        assert!(matches!(
            table.get("Xe"),
            Err(DeckError::MissingPseudopotential(e)) if e == "Xe"
        ));
    }
}
