//! Crystal structures in POSCAR format.
//!
//! Reading and writing go through `vasp-poscar`; this module keeps only
//! what the workflow needs on top of it: species, counts, lattice and
//! fractional positions, volume, and the two deformations used by strained
//! sub-runs. Symmetry analysis is out of reach here; structures are used
//! as given.

use nalgebra::{Matrix3, Vector3};
use std::path::Path;
use vasp_poscar::{Builder, Coords, Poscar};

use crate::errors::StructureError;

/// A periodic crystal structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    /// First POSCAR line.
    pub comment: String,
    /// Lattice vectors as rows in Å, scale factor already applied.
    pub lattice: Matrix3<f64>,
    /// Species labels in file order.
    pub species: Vec<String>,
    /// Atom count per species.
    pub counts: Vec<usize>,
    /// Fractional coordinates, grouped by species.
    pub positions: Vec<Vector3<f64>>,
}

impl Structure {
    /// Parses POSCAR/CONTCAR text.
    ///
    /// The scale line (a factor, or a target volume when negative) is
    /// folded into the lattice. Cartesian positions are converted to
    /// fractional ones. Files without a species line fall back to the
    /// symbols in the comment, as phonopy and ASE write them.
    pub fn from_poscar(text: &str) -> Result<Self, StructureError> {
        let poscar = Poscar::from_reader(text.as_bytes()).map_err(|e| StructureError::new(e.to_string()))?;

        let rows = poscar.scaled_lattice_vectors();
        let lattice = Matrix3::from_fn(|i, j| rows[i][j]);
        let counts: Vec<usize> = poscar.group_counts().collect();
        let species: Vec<String> = match poscar.group_symbols() {
            Some(symbols) => symbols.map(str::to_string).collect(),
            None => {
                let words: Vec<String> = poscar.comment().split_whitespace().map(str::to_string).collect();
                if words.len() != counts.len() {
                    return Err(StructureError::new(
                        "species symbols are missing from both the species line and the comment",
                    ));
                }
                words
            }
        };

        let positions = match poscar.scaled_positions() {
            Coords::Frac(frac) => frac.iter().map(|p| Vector3::from(*p)).collect(),
            Coords::Cart(cart) => {
                let to_fractional = lattice
                    .transpose()
                    .try_inverse()
                    .ok_or_else(|| StructureError::new("lattice vectors are degenerate"))?;
                cart.iter().map(|p| to_fractional * Vector3::from(*p)).collect()
            }
        };

        Ok(Self {
            comment: poscar.comment().trim().to_string(),
            lattice,
            species,
            counts,
            positions,
        })
    }

    /// Reads a structure file.
    pub fn read(path: &Path) -> Result<Self, StructureError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StructureError::new(format!("cannot read {}: {e}", path.display())))?;
        Self::from_poscar(&text)
    }

    /// Renders POSCAR text in direct coordinates. Output depends only on
    /// the structure's values.
    pub fn to_poscar(&self) -> Result<String, StructureError> {
        if self.species.len() != self.counts.len() || self.positions.len() != self.num_atoms() {
            return Err(StructureError::new("species, counts and positions disagree"));
        }
        let lattice: [[f64; 3]; 3] = std::array::from_fn(|i| std::array::from_fn(|j| self.lattice[(i, j)]));
        let positions: Vec<[f64; 3]> = self.positions.iter().map(|p| [p.x, p.y, p.z]).collect();
        let poscar = Builder::new()
            .comment(self.comment.as_str())
            .lattice_vectors(&lattice)
            .positions(Coords::Frac(positions))
            .site_symbols(self.site_labels())
            .build()
            .map_err(|e| StructureError::new(e.to_string()))?;
        Ok(poscar.to_string())
    }

    fn site_labels(&self) -> impl Iterator<Item = &str> {
        self.species
            .iter()
            .zip(&self.counts)
            .flat_map(|(s, &c)| std::iter::repeat(s.as_str()).take(c))
    }

    /// Cell volume in Å³.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.lattice.determinant().abs()
    }

    /// Number of atoms.
    #[must_use]
    pub fn num_atoms(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Element symbols in file order, with potential suffixes removed.
    #[must_use]
    pub fn elements(&self) -> Vec<String> {
        self.species.iter().map(|s| element_symbol(s)).collect()
    }

    /// Reduced formula-like name, e.g. `Na1Cl1`.
    #[must_use]
    pub fn formula(&self) -> String {
        self.elements()
            .iter()
            .zip(&self.counts)
            .map(|(e, c)| format!("{e}{c}"))
            .collect()
    }

    /// Same structure with every lattice vector multiplied by `factor`.
    #[must_use]
    pub fn scaled_by(&self, factor: f64) -> Self {
        Self {
            lattice: self.lattice * factor,
            ..self.clone()
        }
    }

    /// Applies the homogeneous deformation `I + strain` to the lattice,
    /// keeping fractional positions.
    #[must_use]
    pub fn deformed(&self, strain: &Matrix3<f64>) -> Self {
        let deformation = Matrix3::identity() + strain;
        Self {
            lattice: self.lattice * deformation.transpose(),
            ..self.clone()
        }
    }

    /// Lengths of the three lattice vectors in Å.
    #[must_use]
    pub fn lattice_lengths(&self) -> [f64; 3] {
        [
            self.lattice.row(0).norm(),
            self.lattice.row(1).norm(),
            self.lattice.row(2).norm(),
        ]
    }
}

/// Strips pseudopotential suffixes such as `_pv` or `/abc123`.
fn element_symbol(label: &str) -> String {
    label
        .split(['_', '/', '.'])
        .next()
        .unwrap_or(label)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NACL: &str = "NaCl
1.0
0.0 2.82 2.82
2.82 0.0 2.82
2.82 2.82 0.0
Na Cl
1 1
direct
0.0 0.0 0.0 Na
0.5 0.5 0.5 Cl
";

    #[test]
    fn test_parse_direct() {
        let s = Structure::from_poscar(NACL).unwrap();
        assert_eq!(s.species, vec!["Na", "Cl"]);
        assert_eq!(s.num_atoms(), 2);
        assert!((s.volume() - 2.0 * 2.82_f64.powi(3)).abs() < 1e-9);
        assert_eq!(s.formula(), "Na1Cl1");
    }

    #[test]
    fn test_parse_cartesian_and_selective() {
        let text = "cubic
2.0
1.0 0.0 0.0
0.0 1.0 0.0
0.0 0.0 1.0
Fe_pv
2
Selective dynamics
Cartesian
0.0 0.0 0.0 T T T
0.5 0.5 0.5 F F F
";
        let s = Structure::from_poscar(text).unwrap();
        assert!((s.volume() - 8.0).abs() < 1e-12);
        assert!((s.positions[1] - Vector3::new(0.5, 0.5, 0.5)).norm() < 1e-12);
        assert_eq!(s.lattice[(0, 0)], 2.0);
        assert_eq!(s.elements(), vec!["Fe"]);
    }

    #[test]
    fn test_negative_scale_is_volume() {
        let text = NACL.replacen("1.0", "-100.0", 1);
        let s = Structure::from_poscar(&text).unwrap();
        assert!((s.volume() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_species_from_comment() {
        let text = NACL.replace("Na Cl\n", "");
        assert!(Structure::from_poscar(&text).is_err());

        let text = NACL.replace("Na Cl\n", "").replacen("NaCl", "Na Cl", 1);
        let s = Structure::from_poscar(&text).unwrap();
        assert_eq!(s.species, vec!["Na", "Cl"]);
    }

    #[test]
    fn test_written_text_reads_back() {
        let s = Structure::from_poscar(NACL).unwrap();
        let text = s.to_poscar().unwrap();
        let back = Structure::from_poscar(&text).unwrap();
        assert_eq!(back.species, s.species);
        assert_eq!(back.counts, s.counts);
        assert!((back.lattice - s.lattice).norm() < 1e-10);
        assert!((back.positions[1] - s.positions[1]).norm() < 1e-10);
        assert_eq!(text, back.to_poscar().unwrap());
    }

    #[test]
    fn test_scaled_by_changes_volume_cubically() {
        let s = Structure::from_poscar(NACL).unwrap();
        let strained = s.scaled_by(1.01);
        assert!((strained.volume() / s.volume() - 1.01_f64.powi(3)).abs() < 1e-12);
        assert_eq!(strained.positions, s.positions);
    }

    #[test]
    fn test_deformation_keeps_fractional_positions() {
        let s = Structure::from_poscar(NACL).unwrap();
        let mut strain = Matrix3::zeros();
        strain[(0, 0)] = 0.01;
        let d = s.deformed(&strain);
        assert_eq!(d.positions, s.positions);
        assert!((d.volume() / s.volume() - 1.01).abs() < 1e-12);
    }

    #[test]
    fn test_lattice_lengths() {
        let s = Structure::from_poscar(NACL).unwrap();
        let expected = (2.0 * 2.82_f64 * 2.82).sqrt();
        for length in s.lattice_lengths() {
            assert!((length - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        assert!(Structure::from_poscar("x\n1.0\n1 0 0\n0 1 0\n").is_err());
        assert!(Structure::from_poscar("NaCl\n1.0\n5.6 0.0\n").is_err());
        assert!(Structure::from_poscar("").is_err());
    }

    #[test]
    fn test_species_and_count_mismatch_is_rejected() {
        let s = Structure {
            counts: vec![1],
            ..Structure::from_poscar(NACL).unwrap()
        };
        assert!(s.to_poscar().is_err());
    }
}
