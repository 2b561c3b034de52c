//! # Analysis Session
//!
//! Holds the immutable inputs of one analysis (expression, technical noise,
//! configuration), the named gene sets, and the K-list of covariance terms
//! accumulated as factors are fitted. Every downstream step reads the K-list
//! from here, so the order of fitted factors is the order of weights in any
//! later decomposition.

use std::collections::BTreeMap;

use crate::assoc::{self, PairTarget, PairwiseAssociation};
use crate::config::EngineConfig;
use crate::decompose::{self, CorrectedExpression, DecompositionBatch};
use crate::error::EngineError;
use crate::factor::{self, Conditioning, CovarianceTerm, FactorRequest, FittedFactor};
use crate::types::{ExpressionMatrix, GeneSet, TechnicalNoise, validate_noise};

/// How a factor fitted through the session relates to earlier factors,
/// referring to them by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentFactor<'n> {
    None,
    ConditionedOn(&'n str),
    InteractingWith(&'n str),
}

pub struct Session {
    expression: ExpressionMatrix,
    noise: TechnicalNoise,
    config: EngineConfig,
    gene_sets: BTreeMap<String, GeneSet>,
    factors: Vec<FittedFactor>,
    terms: Vec<CovarianceTerm>,
}

impl Session {
    pub fn new(
        expression: ExpressionMatrix,
        noise: TechnicalNoise,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        validate_noise(&expression, &noise)?;
        config.validate()?;
        log::info!(
            "Session over {} cells and {} genes",
            expression.n_cells(),
            expression.n_genes()
        );
        Ok(Self {
            expression,
            noise,
            config,
            gene_sets: BTreeMap::new(),
            factors: Vec::new(),
            terms: Vec::new(),
        })
    }

    pub fn expression(&self) -> &ExpressionMatrix {
        &self.expression
    }

    pub fn noise(&self) -> &TechnicalNoise {
        &self.noise
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a named gene set, replacing any earlier set of that name.
    pub fn add_gene_set(
        &mut self,
        name: impl Into<String>,
        indices: Vec<usize>,
    ) -> Result<&GeneSet, EngineError> {
        let set = GeneSet::new(indices, self.expression.n_genes())?;
        let name = name.into();
        log::debug!("Gene set '{}' holds {} genes", name, set.len());
        self.gene_sets.insert(name.clone(), set);
        Ok(&self.gene_sets[&name])
    }

    pub fn gene_set(&self, name: &str) -> Option<&GeneSet> {
        self.gene_sets.get(name)
    }

    /// Fits a factor on a registered gene set and appends its terms to the
    /// K-list: the factor kernel, then the interaction kernel if requested.
    pub fn fit_factor(
        &mut self,
        name: &str,
        gene_set: &str,
        latent_dims: usize,
        ard: bool,
        parent: ParentFactor<'_>,
    ) -> Result<&FittedFactor, EngineError> {
        let genes = self.gene_sets.get(gene_set).ok_or_else(|| {
            EngineError::Input(format!("no gene set named '{gene_set}' has been added"))
        })?;
        let parent_factor = |parent_name: &str| {
            self.factor(parent_name).ok_or_else(|| {
                EngineError::Input(format!(
                    "factor '{name}' is conditioned on '{parent_name}', which has not been fitted"
                ))
            })
        };
        let conditioning = match parent {
            ParentFactor::None => Conditioning::Standalone,
            ParentFactor::ConditionedOn(p) => Conditioning::On(parent_factor(p)?),
            ParentFactor::InteractingWith(p) => Conditioning::WithInteraction(parent_factor(p)?),
        };
        let request = FactorRequest {
            name,
            genes,
            latent_dims,
            ard,
            conditioning,
        };

        let fitted = factor::fit_factor(&self.expression, &self.noise, &request, &self.config)?;
        if let Some(clash) = fitted
            .terms()
            .find(|term| self.terms.iter().any(|t| t.name == term.name))
        {
            return Err(EngineError::Input(format!(
                "a covariance term named '{}' is already in the K-list",
                clash.name
            )));
        }
        self.terms.extend(fitted.terms().cloned());
        self.factors.push(fitted);
        log::info!("K-list now holds {} terms", self.terms.len());
        Ok(&self.factors[self.factors.len() - 1])
    }

    /// Appends a precomputed kernel, e.g. one built from known covariates.
    pub fn add_covariance_term(&mut self, term: CovarianceTerm) -> Result<(), EngineError> {
        factor::validate_terms(std::slice::from_ref(&term), self.expression.n_cells())?;
        if self.terms.iter().any(|t| t.name == term.name) {
            return Err(EngineError::Input(format!(
                "a covariance term named '{}' is already in the K-list",
                term.name
            )));
        }
        self.terms.push(term);
        Ok(())
    }

    pub fn factor(&self, name: &str) -> Option<&FittedFactor> {
        self.factors.iter().find(|f| f.name() == name)
    }

    pub fn factors(&self) -> &[FittedFactor] {
        &self.factors
    }

    /// The K-list, in fitting order.
    pub fn covariance_terms(&self) -> &[CovarianceTerm] {
        &self.terms
    }

    fn require_terms(&self, step: &str) -> Result<&[CovarianceTerm], EngineError> {
        if self.terms.is_empty() {
            return Err(EngineError::Input(format!(
                "{step} needs at least one fitted factor"
            )));
        }
        Ok(&self.terms)
    }

    pub fn variance_decomposition(
        &self,
        genes: &[usize],
    ) -> Result<DecompositionBatch, EngineError> {
        let terms = self.require_terms("variance decomposition")?;
        decompose::variance_decomposition(&self.expression, &self.noise, terms, genes, &self.config)
    }

    pub fn corrected_expression(
        &self,
        batch: &DecompositionBatch,
    ) -> Result<CorrectedExpression, EngineError> {
        let terms = self.require_terms("expression correction")?;
        decompose::correct_expression(&self.expression, batch, terms, &self.config)
    }

    /// Removes only the named terms, keeping the others' effects.
    pub fn corrected_expression_removing(
        &self,
        batch: &DecompositionBatch,
        remove: &[&str],
    ) -> Result<CorrectedExpression, EngineError> {
        let terms = self.require_terms("expression correction")?;
        let positions = remove
            .iter()
            .map(|name| {
                terms.iter().position(|t| t.name == *name).ok_or_else(|| {
                    EngineError::Input(format!("no covariance term named '{name}'"))
                })
            })
            .collect::<Result<Vec<usize>, EngineError>>()?;
        decompose::correct_expression_removing(
            &self.expression,
            batch,
            terms,
            &positions,
            &self.config,
        )
    }

    pub fn associate(
        &self,
        genes: &[usize],
        target: &PairTarget,
    ) -> Result<PairwiseAssociation, EngineError> {
        let terms = self.require_terms("pairwise association")?;
        assoc::associate(&self.expression, &self.noise, terms, genes, target, &self.config)
    }
}
