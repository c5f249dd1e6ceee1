//! Canned inputs and simulated run outputs.

use nalgebra::{Matrix3, Vector3};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{SiteConfig, StageParameters, CALC_CONFIG_FILE, COMPUTING_CONFIG_FILE};
use crate::core::{files, StageKind, Walltime};
use crate::deck::{Pseudopotential, PseudopotentialTable};
use crate::structure::Structure;

/// Rock-salt NaCl primitive cell, two atoms, a = 5.64 Å.
#[must_use]
pub fn nacl_structure() -> Structure {
    let half = 5.64 / 2.0;
    Structure {
        comment: "NaCl".to_string(),
        lattice: Matrix3::new(0.0, half, half, half, 0.0, half, half, half, 0.0),
        species: vec!["Na".to_string(), "Cl".to_string()],
        counts: vec![1, 1],
        positions: vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.5, 0.5, 0.5)],
    }
}

/// Single-point parameters with a one-hour walltime.
#[must_use]
pub fn stage_parameters() -> StageParameters {
    StageParameters {
        walltime: Walltime::from_hours(1),
        prec: "Accurate".to_string(),
        encut: 520.0,
        ediff: 1e-6,
        ediffg: None,
        algo: "Normal".to_string(),
        nelm: None,
        ismear: 0,
        sigma: 0.05,
        ibrion: -1,
        isif: None,
        nsw: 0,
        potim: None,
        lreal: None,
        symprec: None,
        nfree: None,
        kspacing: Some(0.25),
        kppra: None,
        magmom: 5.0,
        extra: BTreeMap::new(),
    }
}

/// A 28-core-per-node site that keeps 4 cores idle.
#[must_use]
pub fn site_config(potcar_dir: &str) -> SiteConfig {
    SiteConfig {
        name: "test".to_string(),
        allocation: Some("p00000".to_string()),
        queue: Some("short".to_string()),
        ncore: 4,
        ncore_per_node: 28,
        potcar_dir: PathBuf::from(potcar_dir),
        user_id: None,
        constraint: None,
        node_multiplier: 1,
        memory_reserve_per_node: 4,
        oom_memory_reserve_per_node: None,
        run_command: "mpirun -np {n_procs} vasp_std".to_string(),
        modules: Vec::new(),
        script_template: None,
    }
}

/// A minimal single-element POTCAR with the given valence.
#[must_use]
pub fn potcar_text(label: &str, zval: f64) -> String {
    format!(
        "  PAW_PBE {label} 06Sep2000\n   POMASS =   22.990; ZVAL   =    {zval:.3}    mass and valenz\n End of Dataset\n"
    )
}

/// Table with a seven-electron potential for each element.
#[must_use]
pub fn potential_table(elements: &[&str]) -> PseudopotentialTable {
    elements.iter().fold(PseudopotentialTable::new(), |table, element| {
        let potential = Pseudopotential {
            label: (*element).to_string(),
            text: potcar_text(element, 7.0),
            zval: 7.0,
        };
        table.with_entry(*element, potential)
    })
}

/// Simulation stdout with one `F=` line per ionic step.
#[must_use]
pub fn vasp_stdout(energies: &[f64], magnetization: Option<f64>, relaxation_converged: bool) -> String {
    let mut out = String::from(" running on   24 total cores\n vasp.6.3.0 (build Jan 01 2023)\n");
    for (step, energy) in energies.iter().enumerate() {
        let _ = writeln!(out, "DAV:   1    {energy:.8}    {energy:.8}   -0.1E-05   416   0.1E-03");
        let _ = write!(out, "   {} F= {energy:.8} E0= {energy:.8}  d E =0.0", step + 1);
        if let Some(mag) = magnetization {
            let _ = write!(out, "  mag=     {mag:.4}");
        }
        out.push('\n');
    }
    if relaxation_converged {
        out.push_str(" reached required accuracy - stopping structural energy minimisation\n");
    }
    out
}

/// Stderr of a job killed at its time limit.
#[must_use]
pub fn walltime_stderr() -> String {
    "slurmstepd: error: *** JOB 4242 ON qnode0101 CANCELLED AT 2024-01-01T00:00:00 DUE TO TIME LIMIT ***\n"
        .to_string()
}

/// OUTCAR fragment with a stress line and a force block.
#[must_use]
pub fn outcar(forces: &[[f64; 3]], stress_kbar: [f64; 6]) -> String {
    let mut out = String::from("  FORCE on cell =-STRESS in cart. coord.  units (eV):\n");
    let _ = writeln!(
        out,
        "  in kB {}",
        stress_kbar.iter().map(|s| format!("{s:12.5}")).collect::<String>()
    );
    out.push_str(" POSITION                                       TOTAL-FORCE (eV/Angst)\n");
    let rule = format!(" {}\n", "-".repeat(83));
    out.push_str(&rule);
    for force in forces {
        let _ = writeln!(
            out,
            "      0.00000      0.00000      0.00000    {:12.6} {:12.6} {:12.6}",
            force[0], force[1], force[2]
        );
    }
    out.push_str(&rule);
    out
}

/// Global parameter document for every stage kind.
#[must_use]
pub fn calc_config_json() -> Value {
    json!({
        "rlx-coarse": {"walltime": "01:00:00", "encut": 400, "ediff": 1e-5, "nsw": 30,
                       "ibrion": 2, "isif": 3, "kspacing": 0.3},
        "rlx": {"walltime": "02:00:00", "encut": 520, "ediff": 1e-6, "ediffg": -0.02,
                "nsw": 60, "ibrion": 2, "isif": 3, "kspacing": 0.2},
        "static": {"walltime": "01:00:00", "encut": 520, "ediff": 1e-7, "ismear": -5,
                   "kspacing": 0.2},
        "bulkmod": {"walltime": "01:00:00", "encut": 520, "ediff": 1e-7, "kspacing": 0.2},
        "elastic": {"walltime": "01:00:00", "encut": 520, "ediff": 1e-7, "kspacing": 0.2}
    })
}

/// A calculations directory laid out under a caller-owned root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Wraps an existing directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The calculations directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the global parameter document and a computing config for
    /// [`site_config`] with its library at `potpaw/`.
    pub fn write_configs(&self) -> io::Result<()> {
        fs::write(
            self.root.join(CALC_CONFIG_FILE),
            serde_json::to_string_pretty(&calc_config_json())?,
        )?;
        let site = serde_json::to_value(site_config("potpaw"))?;
        let computing = json!({"computer": "test", "test": site});
        fs::write(
            self.root.join(COMPUTING_CONFIG_FILE),
            serde_json::to_string_pretty(&computing)?,
        )
    }

    /// Writes `potpaw/<element>/POTCAR` for each element.
    pub fn write_potentials(&self, elements: &[&str]) -> io::Result<()> {
        for element in elements {
            let dir = self.root.join("potpaw").join(element);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("POTCAR"), potcar_text(element, 7.0))?;
        }
        Ok(())
    }

    /// Creates a material directory with its input structure.
    pub fn add_material(&self, name: &str, structure: &Structure) -> io::Result<()> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        let text = structure
            .to_poscar()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        fs::write(dir.join(files::POSCAR), text)
    }

    /// Directory of a stage, or of one of its sub-stages.
    #[must_use]
    pub fn stage_dir(&self, material: &str, kind: StageKind, substage: Option<&str>) -> PathBuf {
        let dir = self.root.join(material).join(kind.dir_name());
        match substage {
            Some(name) => dir.join(name),
            None => dir,
        }
    }

    /// Writes a file into a stage directory as a finished job would.
    pub fn write_output(
        &self,
        material: &str,
        kind: StageKind,
        substage: Option<&str>,
        file: &str,
        text: &str,
    ) -> io::Result<()> {
        let dir = self.stage_dir(material, kind, substage);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(file), text)
    }

    /// Copies the stage's rendered POSCAR to CONTCAR, as a relaxation
    /// that kept its cell would leave it.
    pub fn copy_poscar_to_contcar(
        &self,
        material: &str,
        kind: StageKind,
        substage: Option<&str>,
    ) -> io::Result<()> {
        let dir = self.stage_dir(material, kind, substage);
        fs::copy(dir.join(files::POSCAR), dir.join(files::CONTCAR)).map(|_| ())
    }

    /// Reads the structure a stage was rendered with.
    pub fn rendered_structure(
        &self,
        material: &str,
        kind: StageKind,
        substage: Option<&str>,
    ) -> io::Result<Structure> {
        let path = self.stage_dir(material, kind, substage).join(files::POSCAR);
        Structure::read(&path).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::outputs;

    #[test]
    fn test_simulated_outputs_parse() {
        let stdout = vasp_stdout(&[-10.5, -10.8], Some(0.5), true);
        assert_eq!(outputs::final_energy(&stdout), Some(-10.8));
        assert_eq!(outputs::final_magnetization(&stdout), Some(0.5));

        let outcar = outcar(&[[0.0, 0.3, 0.4]], [-1.0, -2.0, -3.0, 0.0, 0.0, 0.0]);
        assert_eq!(outputs::final_stress(&outcar), Some([-1.0, -2.0, -3.0, 0.0, 0.0, 0.0]));
        assert!((outputs::max_force(&outcar).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_nacl_cell() {
        let s = nacl_structure();
        assert_eq!(s.num_atoms(), 2);
        assert!((s.volume() - 5.64_f64.powi(3) / 4.0).abs() < 1e-9);
    }
}
