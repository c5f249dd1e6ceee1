//! Line scanners for simulation output text.
//!
//! Each scanner returns the value from the last matching line, since a run
//! prints one per ionic step and only the final one matters.

/// Free energy from the last `F=` line of stdout.
#[must_use]
pub fn final_energy(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| number_after(line, "F="))
}

/// Total magnetisation from the last `mag=` line of stdout.
#[must_use]
pub fn final_magnetization(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| number_after(line, "mag="))
}

/// The last `in kB` stress line: XX YY ZZ XY YZ ZX in kilobar.
#[must_use]
pub fn final_stress(outcar: &str) -> Option<[f64; 6]> {
    outcar.lines().rev().find_map(|line| {
        let rest = line.trim_start().strip_prefix("in kB")?;
        let values: Vec<f64> = rest
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        values.get(..6)?.try_into().ok()
    })
}

/// Largest atomic force norm in the last `TOTAL-FORCE` block, in eV/Å.
#[must_use]
pub fn max_force(outcar: &str) -> Option<f64> {
    let lines: Vec<&str> = outcar.lines().collect();
    let header = lines.iter().rposition(|l| l.contains("TOTAL-FORCE"))?;

    let mut max: Option<f64> = None;
    // Header, then a dashed rule, then one row per atom up to the next rule.
    for line in lines.iter().skip(header + 2) {
        if line.trim_start().starts_with("---") {
            break;
        }
        let values: Vec<f64> = line
            .split_whitespace()
            .filter_map(|w| w.parse().ok())
            .collect();
        if values.len() < 6 {
            return None;
        }
        let norm = values[3..6].iter().map(|f| f * f).sum::<f64>().sqrt();
        max = Some(max.map_or(norm, |m: f64| m.max(norm)));
    }
    max
}

fn number_after(line: &str, marker: &str) -> Option<f64> {
    let pos = line.find(marker)?;
    line[pos + marker.len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STDOUT: &str = "\
 DAV:   1    -0.106E+02   -0.106E+02   -0.4E+03   416   0.2E+02
   1 F= -.10838983E+02 E0= -.10838920E+02  d E =-.108390E+02  mag=     2.0021
 DAV:   1    -0.108E+02   -0.108E+02   -0.1E+00   416   0.1E+00
   2 F= -.10840003E+02 E0= -.10839950E+02  d E =-.102E-02  mag=     1.9980
";

    #[test]
    fn test_last_energy_and_moment() {
        assert_eq!(final_energy(STDOUT), Some(-10.840_003));
        assert_eq!(final_magnetization(STDOUT), Some(1.998));
        assert_eq!(final_energy("no energies\n"), None);
    }

    #[test]
    fn test_non_spin_has_no_moment() {
        assert_eq!(final_magnetization("   1 F= -.5E+01 E0= -.5E+01  d E =-.5E+01\n"), None);
    }

    #[test]
    fn test_stress_line() {
        let outcar = "\
  Total     1.0 2.0 3.0 0.0 0.0 0.0
  in kB      -1.00000    -2.00000    -3.00000     0.10000     0.20000     0.30000
  external pressure =       -2.00 kB  Pullay stress =        0.00 kB
  in kB      -4.00000    -5.00000    -6.00000     0.40000     0.50000     0.60000
";
        assert_eq!(final_stress(outcar), Some([-4.0, -5.0, -6.0, 0.4, 0.5, 0.6]));
        assert_eq!(final_stress("  in kB  1.0 2.0\n"), None);
    }

    #[test]
    fn test_max_force_uses_last_block() {
        let outcar = "\
 POSITION                                       TOTAL-FORCE (eV/Angst)
 -----------------------------------------------------------------------------------
      0.00000      0.00000      0.00000         1.000000      0.000000      0.000000
 -----------------------------------------------------------------------------------
 POSITION                                       TOTAL-FORCE (eV/Angst)
 -----------------------------------------------------------------------------------
      0.00000      0.00000      0.00000         0.030000      0.040000      0.000000
      1.41000      1.41000      1.41000        -0.010000      0.000000      0.000000
 -----------------------------------------------------------------------------------
";
        let force = max_force(outcar).unwrap();
        assert!((force - 0.05).abs() < 1e-12);
        assert_eq!(max_force("nothing here"), None);
    }
}
