//! # Pairwise Association
//!
//! Gene-gene linear mixed models. Each response gene is regressed on each
//! predictor gene with an intercept, while the fitted factor kernels absorb
//! covariance between cells. Comparing corrected with uncorrected fits shows
//! which correlations a factor such as the cell cycle induces.

pub mod lmm;

pub use lmm::{LmmFit, PairTarget, PairwiseAssociation, associate, lmm};
