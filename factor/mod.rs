//! # Covariance Builder
//!
//! Turns the expression of a gene set into a normalized cell x cell kernel
//! describing one latent factor (e.g. cell cycle). The kernel is fitted with a
//! linear-kernel Gaussian-process latent variable model; optional automatic
//! relevance determination reports how much variance each latent dimension
//! carries, and a previously fitted factor can be conditioned on, optionally
//! producing an interaction kernel.

pub mod gplvm;
pub mod kernel;

pub use gplvm::{Conditioning, FactorRequest, FittedFactor, fit_factor};
pub use kernel::{CovarianceMatrix, CovarianceTerm, TermOrigin, validate_terms};
