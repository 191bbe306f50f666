//! Error taxonomy shared by every pipeline stage

use std::fmt;

/// A single input row that could not be coerced into a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    /// Zero-based position of the row in the input
    pub row: usize,
    /// Human readable reason
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{} malformed record(s), no usable transactions remain", rejected.len())]
    MalformedRecords { rejected: Vec<MalformedRecord> },

    #[error("feature columns differ from fitted columns: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("degenerate clustering: {0}")]
    DegenerateCluster(String),

    #[error("fitting {variant} failed: {reason}")]
    FitFailure { variant: String, reason: String },

    #[error("registry write failed: {0}")]
    RegistryWrite(String),

    #[error("model {name} version {version} not found in registry")]
    ModelNotFound { name: String, version: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),
}

impl Error {
    pub(crate) fn fit_failure(variant: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::FitFailure {
            variant: variant.into(),
            reason: reason.to_string(),
        }
    }
}
