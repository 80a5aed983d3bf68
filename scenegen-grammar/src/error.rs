//! Error types for the grammar, scene I/O and fitting layers

use crate::params::ParamKey;
use thiserror::Error;

/// Grammar construction and sampling contract violations
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("node '{node}' must have a nonzero number of production rules")]
    NoProductionRules { node: String },

    #[error("node '{node}': number of weights ({weights}) must match number of rules ({rules})")]
    WeightCountMismatch {
        node: String,
        weights: usize,
        rules: usize,
    },

    #[error("node '{node}': rule index {index} is not in this node's rule list")]
    RuleNotRecognized { node: String, index: usize },

    #[error("node '{node}': observed rule set cannot be produced by this node")]
    ObservedSetNotRepresentable { node: String },

    #[error("node '{node}': a covarying set over {rules} rules needs 2^{rules} weights")]
    CovaryingSetTooLarge { node: String, rules: usize },

    #[error("rule '{rule}': observed children do not match declared products")]
    ObservedChildMismatch { rule: String },

    #[error("unknown parameter {0}")]
    UnknownParam(ParamKey),

    #[error("parameter {key} has length {actual}, expected {expected}")]
    ParamShapeMismatch {
        key: ParamKey,
        actual: usize,
        expected: usize,
    },

    #[error("grammar did not terminate within {limit} production steps")]
    DidNotTerminate { limit: usize },

    #[error("node '{node}' is terminal and cannot produce")]
    TerminalCannotProduce { node: String },
}

/// Scene record (de)serialization failures
///
/// Loading is strict: missing required fields are fatal, never defaulted.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("scene record is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("snapshot names unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("object '{object}' has pose of length {len}, expected 3 (planar) or 7 (spatial)")]
    BadPoseLength { object: String, len: usize },

    #[error("terminal node '{0}' expected when rendering scene")]
    NotATerminal(String),
}

/// Fitting-loop failures
#[derive(Debug, Error)]
pub enum FitError {
    #[error("scene could not be associated to the grammar: {0}")]
    Unparseable(String),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("dataset is empty")]
    EmptyDataset,
}
