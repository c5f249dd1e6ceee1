//! Third-order Birch–Murnaghan equation of state.
//!
//! In terms of `x = V^(-2/3)` the third-order Birch–Murnaghan energy is an
//! exact cubic, so the fit is an ordinary linear least-squares problem.
//! V0 is where `dE/dx` vanishes with positive curvature, inside the
//! sampled range. With `E_xx` and `E_xxx` taken there:
//!
//! - `B0 = 4/9 · E_xx · V0^(-7/3)`
//! - `B0' = 4 + 2/3 · x0 · E_xxx / E_xx`

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::round_to;
use crate::errors::AnalysisError;

/// eV/Å³ to GPa.
pub const EV_PER_A3_TO_GPA: f64 = 160.217_662_08;

/// Fitted equation of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EosFit {
    /// Equilibrium volume in Å³.
    pub v0: f64,
    /// Energy at `v0` in eV.
    pub e0: f64,
    /// Bulk modulus in GPa.
    pub b0: f64,
    /// Pressure derivative of the bulk modulus.
    pub b0_prime: f64,
    /// Volumes of the sub-runs.
    pub volumes: Vec<f64>,
    /// Final energies of the sub-runs.
    pub energies: Vec<f64>,
}

/// Fits an energy–volume series.
pub fn fit_birch_murnaghan(volumes: &[f64], energies: &[f64]) -> Result<EosFit, AnalysisError> {
    let fail = |message: &str| AnalysisError::new("bulk-modulus", message);
    if volumes.len() != energies.len() {
        return Err(fail("volume and energy series differ in length"));
    }
    if volumes.len() < 4 {
        return Err(fail("at least four points are needed"));
    }
    if volumes.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
        return Err(fail("volumes must be positive"));
    }

    let xs: Vec<f64> = volumes.iter().map(|v| v.powf(-2.0 / 3.0)).collect();
    // Centre and scale x so the cubic's design matrix stays well conditioned.
    #[allow(clippy::cast_precision_loss)]
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let spread = (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
    if spread <= f64::EPSILON * mean {
        return Err(fail("volumes are all the same"));
    }
    let ts: Vec<f64> = xs.iter().map(|x| (x - mean) / spread).collect();

    let design = DMatrix::from_fn(ts.len(), 4, |row, col| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let power = col as i32;
        ts[row].powi(power)
    });
    let target = DVector::from_column_slice(energies);
    let coefficients = design
        .svd(true, true)
        .solve(&target, 1e-12)
        .map_err(|e| fail(&format!("least squares failed: {e}")))?;
    let (a, b, c, d) = (
        coefficients[0],
        coefficients[1],
        coefficients[2],
        coefficients[3],
    );

    let curvature = |t: f64| 2.0 * c + 6.0 * d * t;
    let (t_min, t_max) = ts
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), t| (lo.min(*t), hi.max(*t)));
    // The minimum has to be bracketed by the sampled volumes.
    let t0 = stationary_points(b, c, d)
        .into_iter()
        .find(|t| (t_min..=t_max).contains(t) && curvature(*t) > 0.0)
        .ok_or_else(|| fail("no energy minimum inside the sampled volumes"))?;

    let x0 = mean + spread * t0;
    let v0 = x0.powf(-1.5);
    let e0 = a + b * t0 + c * t0 * t0 + d * t0.powi(3);
    let e_tt = curvature(t0);
    let e_xx = e_tt / (spread * spread);
    let b0 = 4.0 / 9.0 * e_xx * v0.powf(-7.0 / 3.0) * EV_PER_A3_TO_GPA;
    let b0_prime = 4.0 + 2.0 / 3.0 * x0 * (6.0 * d) / (spread * e_tt);

    Ok(EosFit {
        v0,
        e0,
        b0: round_to(b0, 3),
        b0_prime,
        volumes: volumes.to_vec(),
        energies: energies.to_vec(),
    })
}

/// Real roots of `b + 2c·t + 3d·t² = 0`, without cancellation when `d` is
/// small.
fn stationary_points(b: f64, c: f64, d: f64) -> Vec<f64> {
    let (qa, qb, qc) = (3.0 * d, 2.0 * c, b);
    if qa.abs() < f64::MIN_POSITIVE {
        return if qb.abs() < f64::MIN_POSITIVE { Vec::new() } else { vec![-qc / qb] };
    }
    let discriminant = qb * qb - 4.0 * qa * qc;
    if discriminant < 0.0 {
        return Vec::new();
    }
    let q = -0.5 * (qb + qb.signum() * discriminant.sqrt());
    if q.abs() < f64::MIN_POSITIVE {
        return vec![0.0];
    }
    vec![q / qa, qc / q]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn birch_murnaghan(v: f64, e0: f64, v0: f64, b0: f64, bp: f64) -> f64 {
        let eta = (v0 / v).powf(2.0 / 3.0);
        e0 + 9.0 * v0 * b0 / 16.0 * ((eta - 1.0).powi(3) * bp + (eta - 1.0).powi(2) * (6.0 - 4.0 * eta))
    }

    #[test]
    fn test_recovers_synthetic_curve() {
        let b0 = 0.5; // eV/Å³
        let volumes: Vec<f64> = (0..7).map(|i| 36.0 + 1.5 * f64::from(i)).collect();
        let energies: Vec<f64> = volumes
            .iter()
            .map(|v| birch_murnaghan(*v, -10.0, 40.0, b0, 4.5))
            .collect();

        let fit = fit_birch_murnaghan(&volumes, &energies).unwrap();
        assert!((fit.v0 - 40.0).abs() < 1e-6, "v0 = {}", fit.v0);
        assert!((fit.e0 + 10.0).abs() < 1e-8);
        assert!((fit.b0 - b0 * EV_PER_A3_TO_GPA).abs() < 2e-3, "b0 = {}", fit.b0);
        assert!((fit.b0_prime - 4.5).abs() < 1e-5, "b0' = {}", fit.b0_prime);
        assert_eq!(fit.volumes.len(), 7);
    }

    #[test]
    fn test_rejects_short_or_flat_series() {
        assert!(fit_birch_murnaghan(&[1.0, 2.0, 3.0], &[0.0, 0.0, 0.0]).is_err());
        assert!(fit_birch_murnaghan(&[1.0, 2.0], &[0.0]).is_err());
        let volumes = [36.0, 38.0, 40.0, 42.0, 44.0];
        // Monotonic energies never turn around.
        let energies = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert!(fit_birch_murnaghan(&volumes, &energies).is_err());
    }
}
