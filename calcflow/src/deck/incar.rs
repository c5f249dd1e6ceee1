//! Parameter card rendering.

use serde_json::Value;
use std::fmt::Write as _;

use crate::config::{KPointPolicy, StageParameters};

/// Tags the renderer computes itself; same-named `extra` entries are ignored.
const MANAGED_TAGS: [&str; 6] = ["ispin", "magmom", "ncore", "nbands", "kspacing", "system"];

/// Values the card needs besides the stage parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IncarContext<'a> {
    /// SYSTEM tag.
    pub system: &'a str,
    /// NCORE tag.
    pub ncore: u32,
    /// NBANDS tag.
    pub nbands: u32,
    /// Spin-polarised run.
    pub use_spin: bool,
    /// Atom count per species, for MAGMOM.
    pub counts: &'a [usize],
}

/// Renders the INCAR text. Tag order is fixed.
#[must_use]
pub fn render_incar(params: &StageParameters, ctx: &IncarContext<'_>) -> String {
    let mut tags: Vec<(&str, String)> = vec![
        ("SYSTEM", ctx.system.to_string()),
        ("PREC", params.prec.clone()),
        ("ENCUT", format_float(params.encut)),
        ("EDIFF", format_float(params.ediff)),
    ];
    if let Some(ediffg) = params.ediffg {
        tags.push(("EDIFFG", format_float(ediffg)));
    }
    tags.push(("ALGO", params.algo.clone()));
    if let Some(nelm) = params.nelm {
        tags.push(("NELM", nelm.to_string()));
    }
    tags.push(("ISMEAR", params.ismear.to_string()));
    tags.push(("SIGMA", format_float(params.sigma)));
    tags.push(("IBRION", params.ibrion.to_string()));
    if let Some(isif) = params.isif {
        tags.push(("ISIF", isif.to_string()));
    }
    tags.push(("NSW", params.nsw.to_string()));
    if let Some(potim) = params.potim {
        tags.push(("POTIM", format_float(potim)));
    }
    if ctx.use_spin {
        tags.push(("ISPIN", "2".to_string()));
        let magmom: Vec<String> = ctx
            .counts
            .iter()
            .map(|c| format!("{c}*{}", format_float(params.magmom)))
            .collect();
        tags.push(("MAGMOM", magmom.join(" ")));
    } else {
        tags.push(("ISPIN", "1".to_string()));
    }
    if let Some(lreal) = &params.lreal {
        tags.push(("LREAL", lreal.clone()));
    }
    if let KPointPolicy::Spacing(spacing) = params.k_point_policy() {
        tags.push(("KSPACING", format_float(spacing)));
    }
    if let Some(symprec) = params.symprec {
        tags.push(("SYMPREC", format_float(symprec)));
    }
    if let Some(nfree) = params.nfree {
        tags.push(("NFREE", nfree.to_string()));
    }
    tags.push(("NCORE", ctx.ncore.to_string()));
    tags.push(("NBANDS", ctx.nbands.to_string()));

    let mut out = String::new();
    for (tag, value) in tags {
        let _ = writeln!(out, "{tag} = {value}");
    }
    for (key, value) in &params.extra {
        if MANAGED_TAGS.contains(&key.as_str()) {
            continue;
        }
        let _ = writeln!(out, "{} = {}", key.to_ascii_uppercase(), format_value(value));
    }
    out
}

/// Small and large magnitudes in exponent form, the rest plainly.
pub(crate) fn format_float(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-3..1e6).contains(&magnitude) {
        format!("{value:e}")
    } else {
        format!("{value}")
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => ".TRUE.".to_string(),
        Value::Bool(false) => ".FALSE.".to_string(),
        Value::Number(n) => n
            .as_f64()
            .filter(|_| n.is_f64())
            .map_or_else(|| n.to_string(), format_float),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(format_value).collect::<Vec<_>>().join(" "),
        Value::Null => String::new(),
        Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Walltime;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params() -> StageParameters {
        serde_json::from_value(json!({
            "walltime": "01:00:00", "encut": 520, "ediff": 1e-6, "kspacing": 0.2,
            "lwave": false, "lorbit": 11, "ispin": 2
        }))
        .unwrap()
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1e-6), "1e-6");
        assert_eq!(format_float(520.0), "520");
        assert_eq!(format_float(0.05), "0.05");
        assert_eq!(format_float(1e-8), "1e-8");
        assert_eq!(format_float(0.0), "0");
    }

    #[test]
    fn test_render_non_spin() {
        let ctx = IncarContext {
            system: "Na1Cl1",
            ncore: 4,
            nbands: 12,
            use_spin: false,
            counts: &[1, 1],
        };
        let incar = render_incar(&params(), &ctx);
        assert_eq!(
            incar,
            "SYSTEM = Na1Cl1\nPREC = Accurate\nENCUT = 520\nEDIFF = 1e-6\nALGO = Normal\n\
             ISMEAR = 0\nSIGMA = 0.05\nIBRION = -1\nNSW = 0\nISPIN = 1\nKSPACING = 0.2\n\
             NCORE = 4\nNBANDS = 12\nLORBIT = 11\nLWAVE = .FALSE.\n"
        );
        assert_eq!(params().walltime, Walltime::from_hours(1));
    }

    #[test]
    fn test_render_spin_magmom_per_species() {
        let ctx = IncarContext {
            system: "Fe2O3",
            ncore: 4,
            nbands: 48,
            use_spin: true,
            counts: &[2, 3],
        };
        let incar = render_incar(&params(), &ctx);
        assert!(incar.contains("ISPIN = 2\nMAGMOM = 2*5 3*5\n"));
        assert_eq!(incar.matches("ISPIN").count(), 1);
    }
}
