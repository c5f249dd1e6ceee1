//! Input deck builder.
//!
//! [`build_deck`] is a pure function of its request and the pseudopotential
//! table: the same inputs always give byte-identical files, which lets a
//! re-poll compare fingerprints instead of trusting timestamps.

mod incar;
mod potcar;

pub use incar::{render_incar, IncarContext};
pub use potcar::{Pseudopotential, PseudopotentialTable};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{KPointPolicy, SiteConfig, StageParameters};
use crate::core::{files, StageKind};
use crate::errors::DeckError;
use crate::structure::Structure;

/// Everything a deck is rendered from.
#[derive(Debug, Clone)]
pub struct DeckRequest<'a> {
    /// Stage kind; elastic runs force NCORE = 1.
    pub kind: StageKind,
    /// Effective parameters, remediations included.
    pub params: &'a StageParameters,
    /// Input structure.
    pub structure: &'a Structure,
    /// Computer settings.
    pub site: &'a SiteConfig,
    /// Spin-polarised run.
    pub use_spin: bool,
}

/// Rendered input files keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDeck {
    files: BTreeMap<String, String>,
}

impl InputDeck {
    /// File contents by name.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// File names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// SHA-256 over names and contents, hex encoded.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, text) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(text.as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    /// Writes every file into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, text) in &self.files {
            std::fs::write(dir.join(name), text)?;
        }
        Ok(())
    }
}

/// Builds POSCAR, POTCAR, INCAR and, for density-based k-points, KPOINTS.
pub fn build_deck(
    request: &DeckRequest<'_>,
    table: &PseudopotentialTable,
) -> Result<InputDeck, DeckError> {
    let structure = request.structure;
    if structure.num_atoms() == 0 {
        return Err(DeckError::MalformedStructure("structure has no atoms".to_string()));
    }
    if structure.positions.len() != structure.num_atoms() {
        return Err(DeckError::MalformedStructure(
            "position count does not match species counts".to_string(),
        ));
    }

    let elements = structure.elements();
    let mut potcar = String::new();
    let mut electrons = 0.0;
    for (element, &count) in elements.iter().zip(&structure.counts) {
        let potential = table.get(element)?;
        potcar.push_str(&potential.text);
        if !potential.text.ends_with('\n') {
            potcar.push('\n');
        }
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        electrons += potential.zval * count;
    }

    let ncore = request.site.ncore;
    let nbands = band_count(electrons, ncore);
    let incar_ncore = if request.kind == StageKind::Elastic { 1 } else { ncore };
    let incar = render_incar(
        request.params,
        &IncarContext {
            system: &structure.formula(),
            ncore: incar_ncore,
            nbands,
            use_spin: request.use_spin,
            counts: &structure.counts,
        },
    );

    let mut deck = InputDeck::default();
    let poscar = structure
        .to_poscar()
        .map_err(|e| DeckError::MalformedStructure(e.message))?;
    deck.files.insert(files::POSCAR.to_string(), poscar);
    deck.files.insert(files::POTCAR.to_string(), potcar);
    deck.files.insert(files::INCAR.to_string(), incar);
    if let KPointPolicy::Density(kppra) = request.params.k_point_policy() {
        deck.files
            .insert(files::KPOINTS.to_string(), render_kpoints(structure, kppra));
    }
    Ok(deck)
}

/// NBANDS: three quarters of the valence electrons, rounded up to a
/// multiple of NCORE.
#[must_use]
pub fn band_count(electrons: f64, ncore: u32) -> u32 {
    let ncore = f64::from(ncore.max(1));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bands = ((0.75 * electrons / ncore).ceil() * ncore) as u32;
    bands
}

/// Gamma-centred grid with roughly `kppra` points per reciprocal atom.
fn render_kpoints(structure: &Structure, kppra: u32) -> String {
    #[allow(clippy::cast_precision_loss)]
    let per_atom = f64::from(kppra) / structure.num_atoms() as f64;
    let lengths = structure.lattice_lengths();
    let mult = (per_atom * lengths.iter().product::<f64>()).cbrt();
    let divisions: Vec<String> = lengths
        .iter()
        .map(|l| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n = (mult / l).max(1.0).floor() as u32;
            n.to_string()
        })
        .collect();
    format!(
        "Automatic kppra={kppra}\n0\nGamma\n{}\n",
        divisions.join(" ")
    )
}
