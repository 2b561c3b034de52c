//! # Variance Decomposition
//!
//! Per-gene restricted maximum likelihood against a K-list of covariance
//! terms, and the expression correction built on top of it.
//!
//! Genes are independent: a batch fits them in parallel, and any subset of
//! genes can be decomposed on its own (see [`split_into_shards`]) and merged
//! afterwards with bit-identical per-gene results.

pub mod batch;
pub mod correct;
pub mod reml;
mod seeding;

pub use batch::{DecompositionBatch, NOISE_LABEL, split_into_shards, variance_decomposition};
pub use correct::{CorrectedExpression, correct_expression, correct_expression_removing};
pub use reml::{VarianceComponentResult, fit_gene};
