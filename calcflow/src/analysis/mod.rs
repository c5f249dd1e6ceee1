//! Result extraction for converged stages.
//!
//! Every analyzer either returns a complete result or an
//! [`AnalysisError`]; a stage never records a partial result.

mod elastic;
mod eos;
pub mod outputs;

pub use elastic::{
    elastic_strain_set, fit_elastic_tensor, stress_from_kbar, ElasticResult, StressSample,
    VoigtStrain,
};
pub use eos::{fit_birch_murnaghan, EosFit, EV_PER_A3_TO_GPA};

use serde::{Deserialize, Serialize};

use crate::core::StageKind;
use crate::errors::AnalysisError;
use crate::structure::Structure;

/// Metrics of a converged stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageResult {
    /// Coarse or fine relaxation.
    Relax(RelaxResult),
    /// Fixed-ion run.
    Static(StaticResult),
    /// Equation-of-state fit.
    BulkModulus(EosFit),
    /// Elastic tensor.
    Elastic(ElasticResult),
}

/// Final state of a relaxation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxResult {
    /// Free energy in eV.
    pub final_energy: f64,
    /// Free energy per atom in eV.
    pub final_energy_per_atom: f64,
    /// Magnetic moment per atom; absent for non-spin runs.
    pub magmom_per_atom: Option<f64>,
    /// Volume of the material's input structure in Å³.
    pub initial_volume: f64,
    /// Relaxed volume in Å³.
    pub final_volume: f64,
    /// Relative volume change from the input structure.
    pub total_dv: f64,
    /// The run was spin-polarised.
    pub use_spin: bool,
}

/// Energy, forces and stress of a fixed-ion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticResult {
    /// Free energy in eV.
    pub final_energy: f64,
    /// Free energy per atom in eV.
    pub final_energy_per_atom: f64,
    /// Magnetic moment per atom; absent for non-spin runs.
    pub magmom_per_atom: Option<f64>,
    /// Largest atomic force in eV/Å.
    pub max_force: f64,
    /// Stress in kB as printed: XX YY ZZ XY YZ ZX.
    pub stress_kbar: [f64; 6],
}

/// Rounds to a number of decimal places.
#[must_use]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[allow(clippy::cast_precision_loss)]
fn per_atom(value: f64, structure: &Structure) -> f64 {
    value / structure.num_atoms() as f64
}

fn energy(kind: StageKind, stdout: &str) -> Result<f64, AnalysisError> {
    outputs::final_energy(stdout)
        .ok_or_else(|| AnalysisError::new(kind.to_string(), "no final energy in stdout"))
}

fn moment(stdout: &str, structure: &Structure, use_spin: bool) -> Option<f64> {
    use_spin
        .then(|| outputs::final_magnetization(stdout))
        .flatten()
        .map(|m| per_atom(m, structure))
}

/// Analyzes a converged relaxation.
///
/// `initial` is the material's original structure, `relaxed` the final
/// structure of the run.
pub fn analyze_relax(
    kind: StageKind,
    stdout: &str,
    initial: &Structure,
    relaxed: &Structure,
    use_spin: bool,
) -> Result<RelaxResult, AnalysisError> {
    let final_energy = energy(kind, stdout)?;
    let initial_volume = initial.volume();
    let final_volume = relaxed.volume();
    Ok(RelaxResult {
        final_energy,
        final_energy_per_atom: per_atom(final_energy, relaxed),
        magmom_per_atom: moment(stdout, relaxed, use_spin),
        initial_volume,
        final_volume,
        total_dv: round_to((final_volume - initial_volume) / initial_volume, 4),
        use_spin,
    })
}

/// Analyzes a converged static run; the OUTCAR is required.
pub fn analyze_static(
    stdout: &str,
    outcar: Option<&str>,
    structure: &Structure,
    use_spin: bool,
) -> Result<StaticResult, AnalysisError> {
    let kind = StageKind::Static;
    let outcar = outcar.ok_or_else(|| AnalysisError::new(kind.to_string(), "OUTCAR is missing"))?;
    let final_energy = energy(kind, stdout)?;
    let max_force = outputs::max_force(outcar)
        .ok_or_else(|| AnalysisError::new(kind.to_string(), "no forces in OUTCAR"))?;
    let stress_kbar = outputs::final_stress(outcar)
        .ok_or_else(|| AnalysisError::new(kind.to_string(), "no stress in OUTCAR"))?;
    Ok(StaticResult {
        final_energy,
        final_energy_per_atom: per_atom(final_energy, structure),
        magmom_per_atom: moment(stdout, structure, use_spin),
        max_force,
        stress_kbar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.123_456, 4), 0.1235);
        assert_eq!(round_to(-1.5, 0), -2.0);
    }

    #[test]
    fn test_relax_result() {
        let initial = fixtures::nacl_structure();
        let relaxed = initial.scaled_by(1.01);
        let stdout = fixtures::vasp_stdout(&[-10.5, -10.8], Some(0.5), true);
        let result = analyze_relax(StageKind::Relax, &stdout, &initial, &relaxed, true).unwrap();
        assert_eq!(result.final_energy, -10.8);
        assert_eq!(result.final_energy_per_atom, -5.4);
        assert_eq!(result.magmom_per_atom, Some(0.25));
        assert_eq!(result.total_dv, round_to(1.01_f64.powi(3) - 1.0, 4));

        let no_spin = analyze_relax(StageKind::Relax, &stdout, &initial, &relaxed, false).unwrap();
        assert_eq!(no_spin.magmom_per_atom, None);
    }

    #[test]
    fn test_relax_without_energy_fails() {
        let s = fixtures::nacl_structure();
        let err = analyze_relax(StageKind::CoarseRelax, "crashed\n", &s, &s, true).unwrap_err();
        assert!(err.to_string().contains("no final energy"));
    }

    #[test]
    fn test_static_needs_outcar() {
        let s = fixtures::nacl_structure();
        let stdout = fixtures::vasp_stdout(&[-10.8], None, false);
        assert!(analyze_static(&stdout, None, &s, false).is_err());

        let outcar = fixtures::outcar(&[[0.0, 0.0, 0.3], [0.0, 0.0, -0.3]], [-1.0, -1.0, -1.0, 0.0, 0.0, 0.0]);
        let result = analyze_static(&stdout, Some(&outcar), &s, false).unwrap();
        assert_eq!(result.final_energy, -10.8);
        assert!((result.max_force - 0.3).abs() < 1e-12);
        assert_eq!(result.stress_kbar, [-1.0, -1.0, -1.0, 0.0, 0.0, 0.0]);
    }
}
