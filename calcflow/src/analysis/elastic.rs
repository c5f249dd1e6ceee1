//! Elastic constants from strained fixed-cell runs.
//!
//! Voigt order is xx, yy, zz, yz, xz, xy. Shear components are engineering
//! strains, so a Voigt shear of δ puts δ/2 in each off-diagonal slot.

use nalgebra::{Matrix3, Matrix6, SymmetricEigen};
use serde::{Deserialize, Serialize};

use super::round_to;
use crate::errors::AnalysisError;

/// kilobar to GPa.
const KBAR_TO_GPA: f64 = 0.1;

/// One applied strain: a Voigt component and its signed magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoigtStrain {
    /// Voigt component, 1 to 6.
    pub component: u8,
    /// Signed strain.
    pub delta: f64,
}

impl VoigtStrain {
    /// Symmetric strain tensor for this component.
    #[must_use]
    pub fn tensor(&self) -> Matrix3<f64> {
        let mut eps = Matrix3::zeros();
        let (i, j) = voigt_pair(self.component);
        if i == j {
            eps[(i, i)] = self.delta;
        } else {
            eps[(i, j)] = self.delta / 2.0;
            eps[(j, i)] = self.delta / 2.0;
        }
        eps
    }

    /// Sub-run directory name, e.g. `voigt4_-0.010`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("voigt{}_{:+.3}", self.component, self.delta)
    }
}

fn voigt_pair(component: u8) -> (usize, usize) {
    match component {
        1 => (0, 0),
        2 => (1, 1),
        3 => (2, 2),
        4 => (1, 2),
        5 => (0, 2),
        _ => (0, 1),
    }
}

/// Every Voigt component at every magnitude, both signs.
#[must_use]
pub fn elastic_strain_set(magnitudes: &[f64]) -> Vec<VoigtStrain> {
    let mut set = Vec::with_capacity(12 * magnitudes.len());
    for component in 1..=6 {
        for magnitude in magnitudes {
            for delta in [-magnitude.abs(), magnitude.abs()] {
                set.push(VoigtStrain { component, delta });
            }
        }
    }
    set
}

/// Physical stress in GPa, Voigt order, from an OUTCAR `in kB` line
/// (XX YY ZZ XY YZ ZX, reported with the opposite sign).
#[must_use]
pub fn stress_from_kbar(kbar: [f64; 6]) -> [f64; 6] {
    let [xx, yy, zz, xy, yz, zx] = kbar;
    [xx, yy, zz, yz, zx, xy].map(|v| -v * KBAR_TO_GPA)
}

/// Final stress of one strained run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressSample {
    /// Applied strain.
    pub strain: VoigtStrain,
    /// Stress in GPa, Voigt order.
    pub stress: [f64; 6],
}

/// Elastic tensor and the moduli derived from it, all in GPa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticResult {
    /// Symmetrised stiffness tensor.
    pub tensor: [[f64; 6]; 6],
    /// Voigt bulk modulus.
    pub k_voigt: f64,
    /// Reuss bulk modulus.
    pub k_reuss: f64,
    /// Hill bulk modulus.
    pub k_hill: f64,
    /// Voigt shear modulus.
    pub g_voigt: f64,
    /// Reuss shear modulus.
    pub g_reuss: f64,
    /// Hill shear modulus.
    pub g_hill: f64,
    /// Every eigenvalue of the tensor is positive.
    pub mechanically_stable: bool,
}

/// Fits `C_ij` as the slope of stress component `i` against strain `j`.
pub fn fit_elastic_tensor(samples: &[StressSample]) -> Result<ElasticResult, AnalysisError> {
    let fail = |message: String| AnalysisError::new("elastic", message);

    let mut c = Matrix6::zeros();
    for column in 0..6 {
        let component = u8::try_from(column + 1).unwrap_or(6);
        let points: Vec<&StressSample> = samples
            .iter()
            .filter(|s| s.strain.component == component)
            .collect();
        if points.len() < 2 {
            return Err(fail(format!(
                "component {component} needs at least two strained runs, got {}",
                points.len()
            )));
        }
        let strains: Vec<f64> = points.iter().map(|s| s.strain.delta).collect();
        for row in 0..6 {
            let stresses: Vec<f64> = points.iter().map(|s| s.stress[row]).collect();
            c[(row, column)] = slope(&strains, &stresses)
                .ok_or_else(|| fail(format!("component {component} has no strain spread")))?;
        }
    }
    let c = (c + c.transpose()) / 2.0;
    let c = c.map(|v| round_to(v, 4));

    let diag = c[(0, 0)] + c[(1, 1)] + c[(2, 2)];
    let off = c[(0, 1)] + c[(1, 2)] + c[(0, 2)];
    let shear = c[(3, 3)] + c[(4, 4)] + c[(5, 5)];
    let k_voigt = (diag + 2.0 * off) / 9.0;
    let g_voigt = (diag - off + 3.0 * shear) / 15.0;

    let s = c
        .try_inverse()
        .ok_or_else(|| fail("stiffness tensor is singular".to_string()))?;
    let s_diag = s[(0, 0)] + s[(1, 1)] + s[(2, 2)];
    let s_off = s[(0, 1)] + s[(1, 2)] + s[(0, 2)];
    let s_shear = s[(3, 3)] + s[(4, 4)] + s[(5, 5)];
    let k_reuss = 1.0 / (s_diag + 2.0 * s_off);
    let g_reuss = 15.0 / (4.0 * s_diag - 4.0 * s_off + 3.0 * s_shear);

    let stable = SymmetricEigen::new(c).eigenvalues.iter().all(|e| *e > 0.0);

    let mut tensor = [[0.0; 6]; 6];
    for (i, row) in tensor.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = c[(i, j)];
        }
    }
    Ok(ElasticResult {
        tensor,
        k_voigt: round_to(k_voigt, 4),
        k_reuss: round_to(k_reuss, 4),
        k_hill: round_to((k_voigt + k_reuss) / 2.0, 4),
        g_voigt: round_to(g_voigt, 4),
        g_reuss: round_to(g_reuss, 4),
        g_hill: round_to((g_voigt + g_reuss) / 2.0, 4),
        mechanically_stable: stable,
    })
}

/// Least-squares slope with intercept.
fn slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if sxx < f64::EPSILON * f64::EPSILON {
        return None;
    }
    let sxy: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cubic(c11: f64, c12: f64, c44: f64) -> Matrix6<f64> {
        let mut c = Matrix6::zeros();
        for i in 0..3 {
            for j in 0..3 {
                c[(i, j)] = if i == j { c11 } else { c12 };
            }
            c[(i + 3, i + 3)] = c44;
        }
        c
    }

    /// Stress lines a code would print for the given stiffness.
    fn samples(c: &Matrix6<f64>, magnitudes: &[f64]) -> Vec<StressSample> {
        elastic_strain_set(magnitudes)
            .into_iter()
            .map(|strain| {
                let mut eps = [0.0; 6];
                eps[usize::from(strain.component) - 1] = strain.delta;
                let sigma: Vec<f64> = (0..6)
                    .map(|i| (0..6).map(|j| c[(i, j)] * eps[j]).sum())
                    .collect();
                // Back to the reported kB order and sign, then through the parser.
                let kbar = [sigma[0], sigma[1], sigma[2], sigma[5], sigma[3], sigma[4]]
                    .map(|v| -v / KBAR_TO_GPA);
                StressSample {
                    strain,
                    stress: stress_from_kbar(kbar),
                }
            })
            .collect()
    }

    #[test]
    fn test_strain_set_and_labels() {
        let set = elastic_strain_set(&[0.01]);
        assert_eq!(set.len(), 12);
        assert_eq!(set[0].label(), "voigt1_-0.010");
        assert_eq!(set[7].label(), "voigt4_+0.010");
    }

    #[test]
    fn test_shear_tensor_is_engineering() {
        let eps = VoigtStrain { component: 6, delta: 0.02 }.tensor();
        assert_eq!(eps[(0, 1)], 0.01);
        assert_eq!(eps[(1, 0)], 0.01);
        assert_eq!(eps[(0, 0)], 0.0);
    }

    #[test]
    fn test_cubic_moduli() {
        let result = fit_elastic_tensor(&samples(&cubic(250.0, 100.0, 80.0), &[0.005, 0.01])).unwrap();
        assert_eq!(result.tensor[0][0], 250.0);
        assert_eq!(result.tensor[0][1], 100.0);
        assert_eq!(result.tensor[3][3], 80.0);
        assert_eq!(result.tensor[0][3], 0.0);
        assert_eq!(result.k_voigt, 150.0);
        assert_eq!(result.k_reuss, 150.0);
        assert_eq!(result.g_voigt, 78.0);
        // 5 (C11 - C12) C44 / (4 C44 + 3 (C11 - C12))
        assert!((result.g_reuss - 60_000.0 / 770.0).abs() < 1e-4);
        assert!(result.mechanically_stable);
    }

    #[test]
    fn test_unstable_tensor() {
        let result = fit_elastic_tensor(&samples(&cubic(100.0, 150.0, 80.0), &[0.01])).unwrap();
        assert!(!result.mechanically_stable);
    }

    #[test]
    fn test_missing_component() {
        let mut all = samples(&cubic(250.0, 100.0, 80.0), &[0.01]);
        all.retain(|s| s.strain.component != 5);
        assert!(fit_elastic_tensor(&all).is_err());
    }
}
