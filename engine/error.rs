// engine/error.rs

//! Error types shared by every component of the engine.
//!
//! Construction-time problems (bad gene sets, mismatched shapes, invalid
//! configuration) surface as an [`EngineError`] before any fitting starts.
//! Failures of a single gene or gene pair never abort a batch; they are recorded
//! on the per-unit result as a [`FitFailure`] next to its `converged` flag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for the modeling engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Optimization did not converge after {iterations} iterations: {reason}")]
    Convergence { iterations: usize, reason: String },

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("Numerical instability in {context}: {reason}")]
    NumericalInstability { context: String, reason: String },

    #[error("A dense linear algebra routine failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Failed to parse TOML configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn dimension(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    pub(crate) fn unstable(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NumericalInstability {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single gene or gene pair was marked as not converged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitFailure {
    /// Every optimizer restart ended in an error (line search, iteration cap).
    Optimizer(String),
    /// The fit reached a solution with zero total variance or non-finite weights.
    Degenerate,
    /// The per-unit time budget ran out before the optimizer terminated.
    TimedOut,
    /// A covariance factorization failed even with the minimum diagonal jitter.
    Numerical(String),
}

impl std::fmt::Display for FitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Optimizer(reason) => write!(f, "optimizer failed: {reason}"),
            Self::Degenerate => write!(f, "degenerate solution"),
            Self::TimedOut => write!(f, "time budget exceeded"),
            Self::Numerical(reason) => write!(f, "numerical failure: {reason}"),
        }
    }
}
