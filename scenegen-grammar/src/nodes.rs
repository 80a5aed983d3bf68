//! Grammar node taxonomy
//!
//! A node is a typed grammar symbol: one struct carrying a selection
//! strategy (Terminal / Or / And / CovaryingSet / IndependentSet), an
//! orthogonal root-capability flag, and the node's production rules. Each
//! strategy is a distribution over which subset of the rules fires;
//! sampling and scoring are matched operations over that distribution.
//!
//! Nodes are immutable once created. A parse step never mutates a node, it
//! creates new child node instances.

use crate::dist::{BernoulliSet, Categorical};
use crate::error::GrammarError;
use crate::params::{ConstraintKind, GradientMap, ParamKey, ParamStore};
use crate::pose::Pose;
use crate::rules::ProductionRule;
use crate::scene::SceneObject;
use rand::RngCore;
use std::fmt;

/// Payload of a terminal node: a concrete object instance
#[derive(Debug, Clone)]
pub struct TerminalPayload {
    pub class: String,
    pub params: Vec<f64>,
    pub params_names: Vec<String>,
    pub asset: Option<String>,
    pub color: Option<[f64; 4]>,
}

/// How a node selects which of its production rules fire
pub enum SelectionStrategy {
    /// Leaf: no rules, never produces
    Terminal,
    /// Exactly one rule fires, chosen by fixed categorical weights
    Or(Categorical),
    /// Every rule fires
    And,
    /// A subset of rules fires, one learned weight per combination (2^n)
    CovaryingSet { weights_key: ParamKey },
    /// A subset of rules fires, each independently with a learned Bernoulli
    IndependentSet { probs_key: ParamKey },
}

impl fmt::Debug for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::Terminal => write!(f, "Terminal"),
            SelectionStrategy::Or(_) => write!(f, "Or"),
            SelectionStrategy::And => write!(f, "And"),
            SelectionStrategy::CovaryingSet { .. } => write!(f, "CovaryingSet"),
            SelectionStrategy::IndependentSet { .. } => write!(f, "IndependentSet"),
        }
    }
}

/// A grammar symbol instance with a fixed pose
pub struct Node {
    name: String,
    class_name: String,
    pose: Pose,
    is_root: bool,
    strategy: SelectionStrategy,
    rules: Vec<Box<dyn ProductionRule>>,
    terminal: Option<TerminalPayload>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("class", &self.class_name)
            .field("strategy", &self.strategy)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl Node {
    /// Leaf node holding a concrete object instance
    pub fn terminal(name: impl Into<String>, pose: Pose, payload: TerminalPayload) -> Self {
        Self {
            name: name.into(),
            class_name: payload.class.clone(),
            pose,
            is_root: false,
            strategy: SelectionStrategy::Terminal,
            rules: Vec::new(),
            terminal: Some(payload),
        }
    }

    /// Or node: exactly one rule fires per production
    pub fn or(
        name: impl Into<String>,
        pose: Pose,
        rules: Vec<Box<dyn ProductionRule>>,
        weights: &[f64],
    ) -> Result<Self, GrammarError> {
        let name = name.into();
        if rules.is_empty() {
            return Err(GrammarError::NoProductionRules { node: name });
        }
        if weights.len() != rules.len() {
            return Err(GrammarError::WeightCountMismatch {
                node: name,
                weights: weights.len(),
                rules: rules.len(),
            });
        }
        Ok(Self {
            class_name: name.clone(),
            name,
            pose,
            is_root: false,
            strategy: SelectionStrategy::Or(Categorical::new(weights)),
            rules,
            terminal: None,
        })
    }

    /// And node: every rule fires per production
    pub fn and(
        name: impl Into<String>,
        pose: Pose,
        rules: Vec<Box<dyn ProductionRule>>,
    ) -> Result<Self, GrammarError> {
        let name = name.into();
        if rules.is_empty() {
            return Err(GrammarError::NoProductionRules { node: name });
        }
        Ok(Self {
            class_name: name.clone(),
            name,
            pose,
            is_root: false,
            strategy: SelectionStrategy::And,
            rules,
            terminal: None,
        })
    }

    /// Covarying ("exhaustive") set node.
    ///
    /// Builds a categorical over all 2^n rule combinations from sparse
    /// hints (subset of rule indices -> relative weight) plus a uniform
    /// `remaining_weight` on every unlisted combination, normalized to one.
    /// The weight table is registered in the store under `weights_key`
    /// (idempotently, so learned weights survive reconstruction).
    pub fn covarying_set(
        name: impl Into<String>,
        pose: Pose,
        rules: Vec<Box<dyn ProductionRule>>,
        hints: &[(&[usize], f64)],
        remaining_weight: f64,
        weights_key: ParamKey,
        store: &mut ParamStore,
    ) -> Result<Self, GrammarError> {
        let name = name.into();
        if rules.is_empty() {
            return Err(GrammarError::NoProductionRules { node: name });
        }
        if rules.len() > 16 {
            return Err(GrammarError::CovaryingSetTooLarge {
                node: name,
                rules: rules.len(),
            });
        }
        assert!(remaining_weight >= 0.0);

        let num_combinations = 1usize << rules.len();
        let mut init_weights = vec![remaining_weight; num_combinations];
        for (subset, weight) in hints {
            assert!(*weight >= 0.0);
            let mut combination_index = 0usize;
            for &index in subset.iter() {
                if index >= rules.len() {
                    return Err(GrammarError::RuleNotRecognized { node: name, index });
                }
                combination_index |= 1 << index;
            }
            init_weights[combination_index] = *weight;
        }
        let total: f64 = init_weights.iter().sum();
        assert!(total > 0.0, "covarying set weights must not all be zero");
        for w in init_weights.iter_mut() {
            *w /= total;
        }

        let weights_key = store.register(weights_key, &init_weights, ConstraintKind::Simplex);

        Ok(Self {
            class_name: name.clone(),
            name,
            pose,
            is_root: false,
            strategy: SelectionStrategy::CovaryingSet { weights_key },
            rules,
            terminal: None,
        })
    }

    /// Covarying set node over a weight table that is already registered.
    ///
    /// Child factories only hold shared store access, so nodes built during
    /// expansion use this form; the weight table must have been registered
    /// (e.g. by the grammar's `register`) beforehand.
    pub fn covarying_set_from_store(
        name: impl Into<String>,
        pose: Pose,
        rules: Vec<Box<dyn ProductionRule>>,
        weights_key: ParamKey,
        store: &ParamStore,
    ) -> Result<Self, GrammarError> {
        let name = name.into();
        if rules.is_empty() {
            return Err(GrammarError::NoProductionRules { node: name });
        }
        if rules.len() > 16 {
            return Err(GrammarError::CovaryingSetTooLarge {
                node: name,
                rules: rules.len(),
            });
        }
        store.value_checked(&weights_key, 1 << rules.len())?;
        Ok(Self {
            class_name: name.clone(),
            name,
            pose,
            is_root: false,
            strategy: SelectionStrategy::CovaryingSet { weights_key },
            rules,
            terminal: None,
        })
    }

    /// Independent set node: each rule fires on its own Bernoulli.
    ///
    /// `probs_key` must already be registered (one probability per rule);
    /// the shape is validated here so a typo fails at construction.
    pub fn independent_set(
        name: impl Into<String>,
        pose: Pose,
        rules: Vec<Box<dyn ProductionRule>>,
        probs_key: ParamKey,
        store: &ParamStore,
    ) -> Result<Self, GrammarError> {
        let name = name.into();
        if rules.is_empty() {
            return Err(GrammarError::NoProductionRules { node: name });
        }
        store.value_checked(&probs_key, rules.len())?;
        Ok(Self {
            class_name: name.clone(),
            name,
            pose,
            is_root: false,
            strategy: SelectionStrategy::IndependentSet { probs_key },
            rules,
            terminal: None,
        })
    }

    /// Mark this node as a grammar root
    pub fn into_root(mut self) -> Self {
        self.is_root = true;
        self
    }

    /// Override the class name (composites default their class to the node
    /// name; shared classes like "place_setting" set it explicitly)
    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.strategy, SelectionStrategy::Terminal)
    }

    pub fn strategy(&self) -> &SelectionStrategy {
        &self.strategy
    }

    pub fn rules(&self) -> &[Box<dyn ProductionRule>] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> &dyn ProductionRule {
        self.rules[index].as_ref()
    }

    pub fn terminal_payload(&self) -> Option<&TerminalPayload> {
        self.terminal.as_ref()
    }

    /// Upper bound on children one production of this node can create.
    /// Every node declares this so total parse-tree size is provably
    /// finite given the expansion iteration cap.
    pub fn max_children(&self) -> usize {
        self.rules
            .iter()
            .map(|r| r.product_classes().len())
            .sum()
    }

    /// Render a terminal node to a scene object
    pub fn to_scene_object(&self) -> Result<SceneObject, crate::error::SceneError> {
        let payload = self
            .terminal
            .as_ref()
            .ok_or_else(|| crate::error::SceneError::NotATerminal(self.name.clone()))?;
        let pose = match &self.pose {
            Pose::Planar(p) => p.to_vec(),
            Pose::Spatial(p) => p.to_quaternion_pose().to_vec(),
        };
        Ok(SceneObject {
            class: payload.class.clone(),
            params: payload.params.clone(),
            params_names: payload.params_names.clone(),
            pose,
            color: payload.color,
            img_path: payload.asset.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Production-rule selection
    // ------------------------------------------------------------------

    fn validate_selection(&self, selected: &[usize]) -> Result<(), GrammarError> {
        let mut last: Option<usize> = None;
        for &index in selected {
            if index >= self.rules.len() {
                return Err(GrammarError::RuleNotRecognized {
                    node: self.name.clone(),
                    index,
                });
            }
            // Require strictly ascending order so a selection has one
            // canonical encoding
            if let Some(prev) = last {
                if index <= prev {
                    return Err(GrammarError::ObservedSetNotRepresentable {
                        node: self.name.clone(),
                    });
                }
            }
            last = Some(index);
        }
        Ok(())
    }

    fn selection_to_mask(&self, selected: &[usize]) -> Vec<bool> {
        let mut mask = vec![false; self.rules.len()];
        for &index in selected {
            mask[index] = true;
        }
        mask
    }

    fn selection_to_combination(&self, selected: &[usize]) -> usize {
        selected.iter().fold(0usize, |acc, &i| acc | (1 << i))
    }

    /// Sample which rules fire.
    ///
    /// With `observed` set, the selection is conditioned on the observed
    /// rule set (validated, then returned deterministically) — the
    /// constrained sampling mode used when scoring real data. Indices are
    /// returned in ascending order.
    pub fn sample_production_rules(
        &self,
        rng: &mut dyn RngCore,
        store: &ParamStore,
        observed: Option<&[usize]>,
    ) -> Result<Vec<usize>, GrammarError> {
        if self.is_terminal() {
            return Err(GrammarError::TerminalCannotProduce {
                node: self.name.clone(),
            });
        }

        if let Some(observed) = observed {
            self.validate_selection(observed)?;
            match &self.strategy {
                SelectionStrategy::Or(_) if observed.len() != 1 => {
                    return Err(GrammarError::ObservedSetNotRepresentable {
                        node: self.name.clone(),
                    });
                }
                SelectionStrategy::And if observed.len() != self.rules.len() => {
                    return Err(GrammarError::ObservedSetNotRepresentable {
                        node: self.name.clone(),
                    });
                }
                _ => {}
            }
            return Ok(observed.to_vec());
        }

        match &self.strategy {
            SelectionStrategy::Terminal => unreachable!("checked above"),
            SelectionStrategy::Or(dist) => Ok(vec![dist.sample(rng)]),
            SelectionStrategy::And => Ok((0..self.rules.len()).collect()),
            SelectionStrategy::CovaryingSet { weights_key } => {
                let weights = store.value_checked(weights_key, 1 << self.rules.len())?;
                let combination = Categorical::new(&weights).sample(rng);
                Ok((0..self.rules.len())
                    .filter(|k| (combination >> k) & 1 == 1)
                    .collect())
            }
            SelectionStrategy::IndependentSet { probs_key } => {
                let probs = store.value_checked(probs_key, self.rules.len())?;
                let mask = BernoulliSet::new(&probs).sample(rng);
                Ok((0..self.rules.len()).filter(|&k| mask[k]).collect())
            }
        }
    }

    /// Exact log-probability of a rule selection under this node's current
    /// distribution. Returns -inf when the selection cannot be produced
    /// (e.g. an And node asked for a strict subset).
    pub fn score_production_rules(
        &self,
        selected: &[usize],
        store: &ParamStore,
    ) -> Result<f64, GrammarError> {
        self.score_production_rules_impl(selected, store, None)
    }

    /// Like [`score_production_rules`](Self::score_production_rules), also
    /// accumulating gradients for learned selection weights.
    pub fn score_production_rules_grad(
        &self,
        selected: &[usize],
        store: &ParamStore,
        grads: &mut GradientMap,
    ) -> Result<f64, GrammarError> {
        self.score_production_rules_impl(selected, store, Some(grads))
    }

    fn score_production_rules_impl(
        &self,
        selected: &[usize],
        store: &ParamStore,
        grads: Option<&mut GradientMap>,
    ) -> Result<f64, GrammarError> {
        if self.is_terminal() {
            return Err(GrammarError::TerminalCannotProduce {
                node: self.name.clone(),
            });
        }
        if self.validate_selection(selected).is_err() {
            return Ok(f64::NEG_INFINITY);
        }

        match &self.strategy {
            SelectionStrategy::Terminal => unreachable!("checked above"),
            SelectionStrategy::Or(dist) => {
                if selected.len() != 1 {
                    return Ok(f64::NEG_INFINITY);
                }
                Ok(dist.log_prob(selected[0]))
            }
            SelectionStrategy::And => {
                if selected.len() == self.rules.len() {
                    Ok(0.0)
                } else {
                    Ok(f64::NEG_INFINITY)
                }
            }
            SelectionStrategy::CovaryingSet { weights_key } => {
                let weights = store.value_checked(weights_key, 1 << self.rules.len())?;
                let dist = Categorical::new(&weights);
                let combination = self.selection_to_combination(selected);
                if let Some(grads) = grads {
                    grads.accumulate(weights_key, &dist.log_prob_grad(combination));
                }
                Ok(dist.log_prob(combination))
            }
            SelectionStrategy::IndependentSet { probs_key } => {
                let probs = store.value_checked(probs_key, self.rules.len())?;
                let dist = BernoulliSet::new(&probs);
                let mask = self.selection_to_mask(selected);
                if let Some(grads) = grads {
                    grads.accumulate(probs_key, &dist.log_prob_grad(&mask));
                }
                Ok(dist.log_prob(&mask))
            }
        }
    }
}
