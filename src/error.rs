//src/error.rs

use thiserror::Error;

/// Every failure the library can report.
///
/// Format errors come from malformed or mismatched text input, domain errors
/// from numerically invalid requests, lookup errors from node ids the loaded
/// tree does not have.
#[derive(Debug, Error)]
pub enum OtuError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error in {context}: {message}")]
    Format { context: String, message: String },

    #[error("unmatched model type: trying to read a {found} model into a {expected} object")]
    TypeMismatch { expected: String, found: String },

    #[error("domain error: {0}")]
    Domain(String),

    #[error("node {0} not found in the reference tree")]
    Lookup(i64),

    #[error("inconsistent data: {0}")]
    Consistency(String),
}

impl OtuError {
    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Self {
        OtuError::Format {
            context: context.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OtuError>;
