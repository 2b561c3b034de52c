//! # Engine Configuration
//!
//! Numerical settings for every optimizer in the engine, serialized as TOML.
//! Each section defaults independently, so a configuration file only needs
//! to name the values it overrides.
//!
//! The optimizers are BFGS runs that stop once the gradient norm of the
//! per-cell normalized objective drops below `tolerance`, or report failure
//! when `max_iterations` is reached first.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How many deterministic starting points a per-gene REML fit tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStrategy {
    /// Only the equal-split starting point.
    Single,
    /// Equal split plus a noise-dominated start.
    Light,
    /// Equal split, noise-dominated, and one start dominated by each term.
    Exhaustive,
}

/// Settings for the per-gene variance decomposition optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub seed_strategy: SeedStrategy,
    /// Bounds on starting log-variances, relative to the gene's sample variance.
    pub seed_bounds: (f64, f64),
    /// Wall-clock budget per gene. A gene that exceeds it is marked unconverged.
    pub timeout_secs: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_iterations: 200,
            seed_strategy: SeedStrategy::Light,
            seed_bounds: (-8.0, 0.0),
            timeout_secs: None,
        }
    }
}

impl OptimizerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

/// Settings for the latent-factor (GPLVM) fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GplvmConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Scale every gene of the subset to unit variance before fitting.
    pub standardize: bool,
    /// Rate of the relevance prior on per-dimension latent variance when ARD is requested.
    pub ard_rate: f64,
}

impl Default for GplvmConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_iterations: 1000,
            standardize: true,
            ard_rate: 0.01,
        }
    }
}

/// Settings shared by every covariance factorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Diagonal jitter, relative to the mean diagonal, added before every Cholesky.
    pub jitter: f64,
    /// Relative bound on |K_ij - K_ji| and on negative eigenvalues when a
    /// covariance matrix is accepted.
    pub symmetry_tolerance: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            jitter: 1e-8,
            symmetry_tolerance: 1e-8,
        }
    }
}

/// Settings for pairwise gene association tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Z-score response and predictor genes so that betas are correlation-scaled.
    pub standardize: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self { standardize: true }
    }
}

/// The complete set of numerical settings for one engine session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub decomposition: OptimizerConfig,
    pub gplvm: GplvmConfig,
    pub kernel: KernelConfig,
    pub association: AssociationConfig,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, EngineError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings no optimizer can run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let d = &self.decomposition;
        if !(d.tolerance > 0.0) || !(self.gplvm.tolerance > 0.0) {
            return Err(EngineError::Input(
                "optimizer tolerances must be positive".to_string(),
            ));
        }
        if d.max_iterations == 0 || self.gplvm.max_iterations == 0 {
            return Err(EngineError::Input(
                "optimizer iteration caps must be at least 1".to_string(),
            ));
        }
        if !(d.seed_bounds.0 <= d.seed_bounds.1) {
            return Err(EngineError::Input(format!(
                "seed bounds are inverted: ({}, {})",
                d.seed_bounds.0, d.seed_bounds.1
            )));
        }
        if let Some(secs) = d.timeout_secs {
            if !(secs > 0.0) || !secs.is_finite() {
                return Err(EngineError::Input(format!(
                    "per-gene timeout must be a positive number of seconds, got {secs}"
                )));
            }
        }
        if !(self.kernel.jitter >= 0.0) || !(self.kernel.symmetry_tolerance >= 0.0) {
            return Err(EngineError::Input(
                "kernel jitter and symmetry tolerance must be non-negative".to_string(),
            ));
        }
        if !(self.gplvm.ard_rate >= 0.0) {
            return Err(EngineError::Input(
                "ARD prior rate must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let config = EngineConfig::from_toml_str(
            r#"
            [decomposition]
            max_iterations = 50
            seed_strategy = "Exhaustive"

            [association]
            standardize = false
            "#,
        )
        .unwrap();
        assert_eq!(config.decomposition.max_iterations, 50);
        assert_eq!(config.decomposition.seed_strategy, SeedStrategy::Exhaustive);
        assert_eq!(config.decomposition.tolerance, 1e-5);
        assert!(!config.association.standardize);
        assert!(config.gplvm.standardize);
    }

    #[test]
    fn serialized_defaults_parse_back() {
        let text = EngineConfig::default().to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.gplvm.max_iterations, 1000);
        assert_eq!(parsed.kernel.jitter, 1e-8);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(EngineConfig::from_toml_str("[decomposition]\ntolerance = 0.0").is_err());
        assert!(EngineConfig::from_toml_str("[decomposition]\nseed_bounds = [1.0, -1.0]").is_err());
        assert!(EngineConfig::from_toml_str("[decomposition]\ntimeout_secs = -2.0").is_err());
        assert!(EngineConfig::from_toml_str("[gplvm]\nmax_iterations = 0").is_err());
    }
}
