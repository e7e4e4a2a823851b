//src/model/gtr.rs

use std::io::Write;

use nalgebra::{Matrix4, SymmetricEigen, Vector4};

use super::{check_branch_length, pair_frequencies, parse_floats, renormalize_rows, DnaSubModel};
use crate::error::{OtuError, Result};

pub const NAME: &str = "GTR";

/// Upper-triangle order of the six exchangeabilities in the text format:
/// AC AG AT CG CT GT.
const UPPER: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Eigen-decomposition of `Q`: `Q = U * diag(lambda) * U^-1`.
#[derive(Debug, Clone)]
struct EigenCache {
    lambda: Vector4<f64>,
    u: Matrix4<f64>,
    u_inv: Matrix4<f64>,
}

/// Generalized time-reversible model (Tavaré 1986).
///
/// `q[(i, j)] = r[(i, j)] * pi[j]` off the diagonal, rows sum to zero and the
/// matrix is scaled to a mean rate of one. Because the model is reversible,
/// `Pi^1/2 Q Pi^-1/2` is symmetric, so the decomposition always has real
/// eigenvalues; it is recomputed whenever `Q` changes and reused by every
/// `transition_matrix` call.
#[derive(Debug, Clone)]
pub struct Gtr {
    pi: Vector4<f64>,
    r: Matrix4<f64>,
    q: Matrix4<f64>,
    eigen: EigenCache,
}

impl Default for Gtr {
    /// Uniform frequencies and exchangeabilities, i.e. JC69.
    fn default() -> Self {
        let pi = Vector4::repeat(0.25);
        // exchangeability 4/3 gives a mean rate of one
        let mut r = Matrix4::from_element(4.0 / 3.0);
        r.fill_diagonal(0.0);
        let mut q = Matrix4::from_element(1.0 / 3.0);
        q.fill_diagonal(-1.0);
        let eigen = decompose(&pi, &q);
        Self { pi, r, q, eigen }
    }
}

impl Gtr {
    /// Build from base frequencies and a symmetric exchangeability matrix.
    /// Only the upper triangle of `r` is read.
    pub fn new(pi: Vector4<f64>, r: Matrix4<f64>) -> Result<Self> {
        Self::build(pi, r)
    }

    pub fn rate_matrix(&self) -> &Matrix4<f64> {
        &self.q
    }

    pub fn exchangeabilities(&self) -> &Matrix4<f64> {
        &self.r
    }

    fn build(pi: Vector4<f64>, r: Matrix4<f64>) -> Result<Self> {
        let pi = normalized_pi(&pi)?;
        let r = symmetric_from_upper(&r)?;
        let (q, r) = rate_matrix_from_params(&pi, &r)?;
        let eigen = decompose(&pi, &q);
        Ok(Self { pi, r, q, eigen })
    }

    /// Swap in new parameters; `Q` and the eigen cache are rebuilt together.
    fn set_params(&mut self, pi: Vector4<f64>, r: Matrix4<f64>) -> Result<()> {
        *self = Self::build(pi, r)?;
        Ok(())
    }
}

fn normalized_pi(pi: &Vector4<f64>) -> Result<Vector4<f64>> {
    let sum = pi.sum();
    if pi.iter().any(|x| !x.is_finite() || *x <= 0.0) || sum <= 0.0 {
        return Err(OtuError::Domain(format!(
            "GTR base frequencies must be positive, found {:?}",
            pi.as_slice()
        )));
    }
    Ok(pi / sum)
}

fn symmetric_from_upper(r: &Matrix4<f64>) -> Result<Matrix4<f64>> {
    let mut sym = Matrix4::zeros();
    for &(i, j) in &UPPER {
        let x = r[(i, j)];
        if !x.is_finite() || x < 0.0 {
            return Err(OtuError::Domain(format!(
                "GTR rate parameter ({i},{j}) is invalid: {x}"
            )));
        }
        sym[(i, j)] = x;
        sym[(j, i)] = x;
    }
    Ok(sym)
}

/// Returns `Q` and `R`, both rescaled so the mean substitution rate is one.
fn rate_matrix_from_params(
    pi: &Vector4<f64>,
    r: &Matrix4<f64>,
) -> Result<(Matrix4<f64>, Matrix4<f64>)> {
    let mut q = Matrix4::from_fn(|i, j| if i == j { 0.0 } else { r[(i, j)] * pi[j] });
    for i in 0..4 {
        q[(i, i)] = -q.row(i).sum();
    }
    let mu: f64 = -(0..4).map(|i| pi[i] * q[(i, i)]).sum::<f64>();
    if !(mu > 0.0 && mu.is_finite()) {
        return Err(OtuError::Domain(
            "GTR rate parameters are all zero".to_string(),
        ));
    }
    Ok((q / mu, r / mu))
}

fn decompose(pi: &Vector4<f64>, q: &Matrix4<f64>) -> EigenCache {
    let sqrt_pi = pi.map(f64::sqrt);
    let d_half = Matrix4::from_diagonal(&sqrt_pi);
    let d_half_inv = Matrix4::from_diagonal(&sqrt_pi.map(|x| 1.0 / x));

    let s = d_half * q * d_half_inv;
    let s = (s + s.transpose()) * 0.5;
    let eig = SymmetricEigen::new(s);

    // The stationary mode is known exactly: eigenvalue 0, eigenvector sqrt(pi).
    let mut lambda = eig.eigenvalues;
    let mut vectors = eig.eigenvectors;
    let top = lambda.imax();
    lambda[top] = 0.0;
    vectors.set_column(top, &sqrt_pi);

    EigenCache {
        lambda,
        u: d_half_inv * vectors,
        u_inv: vectors.transpose() * d_half,
    }
}

impl DnaSubModel for Gtr {
    fn model_type(&self) -> &'static str {
        NAME
    }

    fn pi(&self) -> Vector4<f64> {
        self.pi
    }

    fn transition_matrix(&self, v: f64) -> Result<Matrix4<f64>> {
        check_branch_length(v)?;
        if v == 0.0 {
            return Ok(Matrix4::identity());
        }
        let EigenCache { lambda, u, u_inv } = &self.eigen;
        let p = u * Matrix4::from_diagonal(&lambda.map(|l| (l * v).exp())) * u_inv;
        renormalize_rows(p)
    }

    /// Moment estimator: `pi` from `f`, and exchangeabilities from the
    /// symmetrized pooled counts, `R[i][j] = S[i][j] / (pi[i] * pi[j])`.
    fn train(&mut self, pv: &[Matrix4<f64>], f: &Vector4<f64>) -> Result<()> {
        let pi = normalized_pi(f)?;
        let pooled = pv.iter().fold(Matrix4::<f64>::zeros(), |acc, p| acc + p);
        if pooled.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(OtuError::Domain(
                "GTR training counts must be non-negative".to_string(),
            ));
        }
        let sym = (pooled + pooled.transpose()) * 0.5;
        let r = Matrix4::from_fn(|i, j| {
            if i == j {
                0.0
            } else {
                sym[(i, j)] / (pi[i] * pi[j])
            }
        });
        if r.sum() == 0.0 {
            return Err(OtuError::Domain(
                "cannot estimate GTR rates: no substitutions observed".to_string(),
            ));
        }
        self.set_params(pi, r)
    }

    /// `d = -tr(Pi * log(Pi^-1 * F))`, with `F` the symmetrized pair frequencies.
    fn sub_dist(&self, d: &Matrix4<f64>, n: f64) -> Result<f64> {
        let f = pair_frequencies(d, n)?;
        let f = (f + f.transpose()) * 0.5;

        // Pi^-1 F is similar to the symmetric Pi^-1/2 F Pi^-1/2
        let inv_sqrt = Matrix4::from_diagonal(&self.pi.map(|x| 1.0 / x.sqrt()));
        let m = inv_sqrt * f * inv_sqrt;
        let eig = SymmetricEigen::new((m + m.transpose()) * 0.5);
        if let Some(bad) = eig.eigenvalues.iter().find(|&&x| !(x > 0.0)) {
            return Err(OtuError::Domain(format!(
                "GTR distance is saturated (eigenvalue {bad})"
            )));
        }
        let log_m = eig.eigenvectors
            * Matrix4::from_diagonal(&eig.eigenvalues.map(f64::ln))
            * eig.eigenvectors.transpose();

        let dist: f64 = -(0..4).map(|i| self.pi[i] * log_m[(i, i)]).sum::<f64>();
        if !dist.is_finite() {
            return Err(OtuError::Domain(format!("GTR distance is not finite: {dist}")));
        }
        Ok(dist)
    }

    fn write_params(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let pi: Vec<String> = self.pi.iter().map(|x| x.to_string()).collect();
        writeln!(out, "pi: {}", pi.join(" "))?;
        let r: Vec<String> = UPPER.iter().map(|&(i, j)| self.r[(i, j)].to_string()).collect();
        writeln!(out, "R: {}", r.join(" "))
    }

    fn apply_params(&mut self, params: &[(String, String)]) -> Result<()> {
        let mut pi = None;
        let mut r = None;
        for (key, value) in params {
            match key.as_str() {
                "pi" => pi = Some(Vector4::from_column_slice(&parse_floats(key, value, 4)?)),
                "R" => {
                    let vals = parse_floats(key, value, 6)?;
                    let mut m = Matrix4::zeros();
                    for (&(i, j), x) in UPPER.iter().zip(vals) {
                        m[(i, j)] = x;
                    }
                    r = Some(m);
                }
                other => {
                    return Err(OtuError::format(
                        "GTR model",
                        format!("unrecognized line '{other}:'"),
                    ))
                }
            }
        }
        let pi = pi.ok_or_else(|| OtuError::format("GTR model", "missing 'pi:'"))?;
        let r = r.ok_or_else(|| OtuError::format("GTR model", "missing 'R:'"))?;
        self.set_params(pi, r)
            .map_err(|e| OtuError::format("GTR model", e.to_string()))
    }

    fn clone_box(&self) -> Box<dyn DnaSubModel> {
        Box::new(self.clone())
    }
}
