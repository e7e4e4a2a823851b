//src/model/mod.rs

pub mod gtr;
pub mod jc69;
pub mod k80;

use std::fmt;
use std::io::{BufRead, Write};
use std::sync::Arc;

use nalgebra::{Matrix4, Vector4};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{OtuError, Result};

pub use gtr::Gtr;
pub use jc69::Jc69;
pub use k80::K80;

/// Tolerance used when checking that a transition matrix is stochastic.
pub const STOCHASTIC_TOL: f64 = 1e-9;

/// Largest row-sum drift treated as floating-point rounding and renormalized away.
pub const ROUNDING_TOL: f64 = 1e-6;

/// Header comment written before every serialized model.
pub const MODEL_HEADER: &str = "# DNA Substitution Model";

/// A continuous-time Markov model of nucleotide substitution.
pub trait DnaSubModel: fmt::Debug + Send + Sync {
    /// Type tag written as `Type: <name>`.
    fn model_type(&self) -> &'static str;

    /// Stationary base frequencies.
    fn pi(&self) -> Vector4<f64>;

    /// Base transition probabilities along a branch of length `v`.
    fn transition_matrix(&self, v: f64) -> Result<Matrix4<f64>>;

    /// Refit parameters from observed 4x4 substitution counts
    /// (rows = ancestral base, columns = descendant base) and base frequencies.
    fn train(&mut self, pv: &[Matrix4<f64>], f: &Vector4<f64>) -> Result<()>;

    /// Evolutionary distance implied by a pair-count matrix `d` over `n` sites.
    fn sub_dist(&self, d: &Matrix4<f64>, n: f64) -> Result<f64>;

    /// Model-specific `key: value` lines.
    fn write_params(&self, out: &mut dyn Write) -> std::io::Result<()>;

    /// Replace parameters from parsed `key: value` lines.
    /// Must validate everything before touching `self`.
    fn apply_params(&mut self, params: &[(String, String)]) -> Result<()>;

    fn clone_box(&self) -> Box<dyn DnaSubModel>;

    fn serialize_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "{}", MODEL_HEADER)?;
        writeln!(out, "Type: {}", self.model_type())?;
        self.write_params(out)
    }

    fn deserialize_from(&mut self, input: &mut dyn BufRead) -> Result<()> {
        let (found, params) = parse_model_text(input)?;
        if found != self.model_type() {
            return Err(OtuError::TypeMismatch {
                expected: self.model_type().to_string(),
                found,
            });
        }
        self.apply_params(&params)
    }
}

impl Clone for Box<dyn DnaSubModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Read a model of whatever type the stream declares.
pub fn load_model(input: &mut dyn BufRead) -> Result<Box<dyn DnaSubModel>> {
    let (found, params) = parse_model_text(input)?;
    let mut model = new_model(&found)?;
    model.apply_params(&params)?;
    Ok(model)
}

/// A default-parameter model for a type name.
pub fn new_model(model_type: &str) -> Result<Box<dyn DnaSubModel>> {
    match model_type {
        jc69::NAME => Ok(Box::new(Jc69)),
        k80::NAME => Ok(Box::new(K80::default())),
        gtr::NAME => Ok(Box::new(Gtr::default())),
        other => Err(OtuError::format(
            "model",
            format!("unknown substitution model type '{other}'"),
        )),
    }
}

/// Splits model text into its `Type:` tag and the remaining `key: value` pairs.
fn parse_model_text(input: &mut dyn BufRead) -> Result<(String, Vec<(String, String)>)> {
    let mut model_type: Option<String> = None;
    let mut params = Vec::new();

    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or_else(|| {
            OtuError::format(
                format!("model line {}", lineno + 1),
                format!("expected 'key: value', found '{line}'"),
            )
        })?;
        let key = key.trim();
        let value = value.trim();

        match model_type {
            None if key == "Type" => model_type = Some(value.to_string()),
            None => {
                return Err(OtuError::format(
                    format!("model line {}", lineno + 1),
                    format!("expected 'Type:' before '{key}:'"),
                ))
            }
            Some(_) if key == "Type" => {
                return Err(OtuError::format(
                    format!("model line {}", lineno + 1),
                    "duplicate 'Type:' line",
                ))
            }
            Some(_) => params.push((key.to_string(), value.to_string())),
        }
    }

    let model_type =
        model_type.ok_or_else(|| OtuError::format("model", "missing 'Type:' line"))?;
    Ok((model_type, params))
}

/// Parses whitespace separated floats for one parameter line.
pub(crate) fn parse_floats(key: &str, value: &str, expected: usize) -> Result<Vec<f64>> {
    let vals = value
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or_else(|| OtuError::format(format!("'{key}:'"), format!("bad number '{tok}'")))
        })
        .collect::<Result<Vec<f64>>>()?;
    if vals.len() != expected {
        return Err(OtuError::format(
            format!("'{key}:'"),
            format!("expected {expected} values, found {}", vals.len()),
        ));
    }
    Ok(vals)
}

/// Shared guard on branch lengths.
pub(crate) fn check_branch_length(v: f64) -> Result<()> {
    if !v.is_finite() || v < 0.0 {
        return Err(OtuError::Domain(format!("invalid branch length {v}")));
    }
    Ok(())
}

/// Checks finite, non-negative entries and unit row sums.
pub fn check_stochastic(p: &Matrix4<f64>) -> Result<()> {
    for i in 0..4 {
        let row = p.row(i);
        if row.iter().any(|x| !x.is_finite() || *x < -STOCHASTIC_TOL) {
            return Err(OtuError::Domain(format!(
                "transition matrix row {i} has invalid entries: {row:?}"
            )));
        }
        let sum = row.sum();
        if (sum - 1.0).abs() > STOCHASTIC_TOL {
            return Err(OtuError::Domain(format!(
                "transition matrix row {i} sums to {sum}"
            )));
        }
    }
    Ok(())
}

/// Clamp rounding-level negatives to zero and rescale rows to sum to one.
/// Rows further off than `ROUNDING_TOL` are left alone so `check_stochastic`
/// reports them.
pub(crate) fn renormalize_rows(mut p: Matrix4<f64>) -> Result<Matrix4<f64>> {
    for i in 0..4 {
        let mut row = p.row_mut(i);
        if row.iter().any(|x| !x.is_finite() || *x < -ROUNDING_TOL) {
            continue;
        }
        row.iter_mut().for_each(|x| *x = x.max(0.0));
        let sum = row.sum();
        if (sum - 1.0).abs() <= ROUNDING_TOL {
            row /= sum;
        }
    }
    check_stochastic(&p)?;
    Ok(p)
}

/// Validates and normalizes a pair-count matrix to pair frequencies `D / n`.
pub(crate) fn pair_frequencies(d: &Matrix4<f64>, n: f64) -> Result<Matrix4<f64>> {
    if !(n.is_finite() && n > 0.0) {
        return Err(OtuError::Domain(format!("invalid number of sites {n}")));
    }
    if d.iter().any(|x| !x.is_finite() || *x < 0.0) {
        return Err(OtuError::Domain(
            "divergence matrix has negative or non-finite entries".to_string(),
        ));
    }
    Ok(d / n)
}

/// Natural log that refuses saturated arguments.
pub(crate) fn checked_ln(x: f64, what: &str) -> Result<f64> {
    if x > 0.0 && x.is_finite() {
        Ok(x.ln())
    } else {
        Err(OtuError::Domain(format!(
            "{what} is saturated (log argument {x})"
        )))
    }
}

/// A model shared between a training phase and many readers.
///
/// Training takes the write lock, so it can never interleave with
/// `transition_matrix` calls made through the same handle.
#[derive(Clone)]
pub struct SharedModel {
    inner: Arc<RwLock<Box<dyn DnaSubModel>>>,
}

impl SharedModel {
    pub fn new(model: Box<dyn DnaSubModel>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    pub fn train(&self, pv: &[Matrix4<f64>], f: &Vector4<f64>) -> Result<()> {
        self.inner.write().train(pv, f)
    }

    pub fn transition_matrix(&self, v: f64) -> Result<Matrix4<f64>> {
        self.inner.read().transition_matrix(v)
    }

    pub fn pi(&self) -> Vector4<f64> {
        self.inner.read().pi()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn DnaSubModel>> {
        self.inner.read()
    }

    /// A detached copy of the current model.
    pub fn snapshot(&self) -> Box<dyn DnaSubModel> {
        self.inner.read().clone_box()
    }
}

impl fmt::Debug for SharedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedModel").field(&*self.inner.read()).finish()
    }
}
