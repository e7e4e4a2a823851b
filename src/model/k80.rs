//src/model/k80.rs

use std::io::Write;

use nalgebra::{Matrix4, Vector4};

use super::{check_branch_length, check_stochastic, checked_ln, pair_frequencies, parse_floats, DnaSubModel};
use crate::error::{OtuError, Result};
use crate::types::{BASE_A, BASE_C, BASE_G, BASE_T};

pub const NAME: &str = "K80";

/// Transition cells (A<->G, C<->T).
const TRANSITIONS: [(usize, usize); 4] = [
    (BASE_A, BASE_G),
    (BASE_G, BASE_A),
    (BASE_C, BASE_T),
    (BASE_T, BASE_C),
];

/// Transversion cells (purine <-> pyrimidine).
const TRANSVERSIONS: [(usize, usize); 8] = [
    (BASE_A, BASE_C),
    (BASE_A, BASE_T),
    (BASE_C, BASE_A),
    (BASE_C, BASE_G),
    (BASE_G, BASE_C),
    (BASE_G, BASE_T),
    (BASE_T, BASE_A),
    (BASE_T, BASE_G),
];

#[inline]
fn is_transition(i: usize, j: usize) -> bool {
    TRANSITIONS.contains(&(i, j))
}

/// Kimura 1980 two-parameter model.
///
/// Equal base frequencies; `kappa` is the transition/transversion rate ratio.
/// The rate matrix is scaled to one expected substitution per unit branch length,
/// so `kappa == 1` is identical to JC69.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct K80 {
    kappa: f64,
}

impl Default for K80 {
    fn default() -> Self {
        Self { kappa: 1.0 }
    }
}

impl K80 {
    pub fn with_kappa(kappa: f64) -> Result<Self> {
        check_kappa(kappa)?;
        Ok(Self { kappa })
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }
}

fn check_kappa(kappa: f64) -> Result<()> {
    if kappa.is_finite() && kappa >= 0.0 {
        Ok(())
    } else {
        Err(OtuError::Domain(format!("invalid K80 kappa {kappa}")))
    }
}

impl DnaSubModel for K80 {
    fn model_type(&self) -> &'static str {
        NAME
    }

    fn pi(&self) -> Vector4<f64> {
        Vector4::repeat(0.25)
    }

    fn transition_matrix(&self, v: f64) -> Result<Matrix4<f64>> {
        check_branch_length(v)?;
        if v == 0.0 {
            return Ok(Matrix4::identity());
        }
        // unit mean rate: alpha + 2 * beta == 1
        let beta = 1.0 / (self.kappa + 2.0);
        let alpha = self.kappa * beta;
        let e_tv = (-4.0 * beta * v).exp();
        let e_ti = (-2.0 * (alpha + beta) * v).exp();

        let p_same = 0.25 + 0.25 * e_tv + 0.5 * e_ti;
        let p_ti = 0.25 + 0.25 * e_tv - 0.5 * e_ti;
        let p_tv = 0.25 - 0.25 * e_tv;

        let p = Matrix4::from_fn(|i, j| {
            if i == j {
                p_same
            } else if is_transition(i, j) {
                p_ti
            } else {
                p_tv
            }
        });
        check_stochastic(&p)?;
        Ok(p)
    }

    /// kappa = (total transitions) / (total transversions).
    fn train(&mut self, pv: &[Matrix4<f64>], _f: &Vector4<f64>) -> Result<()> {
        let mut ti = 0.0;
        let mut tv = 0.0;
        for p in pv {
            ti += TRANSITIONS.iter().map(|&(i, j)| p[(i, j)]).sum::<f64>();
            tv += TRANSVERSIONS.iter().map(|&(i, j)| p[(i, j)]).sum::<f64>();
        }
        if tv == 0.0 {
            return Err(OtuError::Domain(
                "cannot estimate K80 kappa: no transversions observed".to_string(),
            ));
        }
        let kappa = ti / tv;
        check_kappa(kappa)?;
        self.kappa = kappa;
        Ok(())
    }

    fn sub_dist(&self, d: &Matrix4<f64>, n: f64) -> Result<f64> {
        let f = pair_frequencies(d, n)?;
        let p: f64 = TRANSITIONS.iter().map(|&(i, j)| f[(i, j)]).sum();
        let q: f64 = TRANSVERSIONS.iter().map(|&(i, j)| f[(i, j)]).sum();
        let a = checked_ln(1.0 - 2.0 * p - q, "K80 transition distance")?;
        let b = checked_ln(1.0 - 2.0 * q, "K80 transversion distance")?;
        Ok(-0.5 * a - 0.25 * b)
    }

    fn write_params(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "kappa: {}", self.kappa)
    }

    fn apply_params(&mut self, params: &[(String, String)]) -> Result<()> {
        let mut kappa = None;
        for (key, value) in params {
            match key.as_str() {
                "kappa" => kappa = Some(parse_floats(key, value, 1)?[0]),
                other => {
                    return Err(OtuError::format(
                        "K80 model",
                        format!("unrecognized line '{other}:'"),
                    ))
                }
            }
        }
        let kappa = kappa.ok_or_else(|| OtuError::format("K80 model", "missing 'kappa:'"))?;
        check_kappa(kappa).map_err(|e| OtuError::format("K80 model", e.to_string()))?;
        self.kappa = kappa;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn DnaSubModel> {
        Box::new(*self)
    }
}
