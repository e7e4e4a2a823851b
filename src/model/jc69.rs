//src/model/jc69.rs

use std::io::Write;

use nalgebra::{Matrix4, Vector4};

use super::{check_branch_length, check_stochastic, checked_ln, pair_frequencies, DnaSubModel};
use crate::error::{OtuError, Result};

pub const NAME: &str = "JC69";

/// Jukes-Cantor 1969: equal base frequencies and a single substitution rate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Jc69;

impl DnaSubModel for Jc69 {
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
        let e = (-4.0 * v / 3.0).exp();
        let mut p = Matrix4::from_element((1.0 - e) / 4.0);
        p.fill_diagonal((1.0 + 3.0 * e) / 4.0);
        check_stochastic(&p)?;
        Ok(p)
    }

    /// Parameter free.
    fn train(&mut self, _pv: &[Matrix4<f64>], _f: &Vector4<f64>) -> Result<()> {
        Ok(())
    }

    fn sub_dist(&self, d: &Matrix4<f64>, n: f64) -> Result<f64> {
        let f = pair_frequencies(d, n)?;
        let p = 1.0 - f.trace();
        Ok(-0.75 * checked_ln(1.0 - 4.0 * p / 3.0, "JC69 distance")?)
    }

    fn write_params(&self, _out: &mut dyn Write) -> std::io::Result<()> {
        Ok(())
    }

    fn apply_params(&mut self, params: &[(String, String)]) -> Result<()> {
        match params.first() {
            None => Ok(()),
            Some((key, _)) => Err(OtuError::format(
                "JC69 model",
                format!("unrecognized line '{key}:'"),
            )),
        }
    }

    fn clone_box(&self) -> Box<dyn DnaSubModel> {
        Box::new(*self)
    }
}
