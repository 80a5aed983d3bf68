//! Production rules: stochastic edges from a parent node to child nodes
//!
//! A rule pairs a sampling operation with a scoring operation over the same
//! distribution. The common case draws a relative pose offset from a
//! per-site learned Normal and chains it onto the parent's absolute pose;
//! given observed children it inverts that chain exactly to recover the
//! implied relative offset for likelihood scoring.

use crate::dist::DiagonalNormal;
use crate::error::GrammarError;
use crate::nodes::Node;
use crate::params::{GradientMap, ParamKey, ParamStore};
use crate::pose::Pose;
use rand::RngCore;
use std::sync::Arc;

/// Builds a child node at a freshly sampled absolute pose.
///
/// Factories only read the store (all parameters are registered up front by
/// the grammar), so sampling never needs mutable store access.
pub type ChildFactory =
    Arc<dyn Fn(&str, Pose, &ParamStore) -> Result<Node, GrammarError> + Send + Sync>;

/// A named, callable edge from one parent node to a declared set of products
pub trait ProductionRule: Send + Sync {
    fn name(&self) -> &str;

    /// Class names of the children this rule produces, in order
    fn product_classes(&self) -> &[String];

    /// Produce child node instances.
    ///
    /// With `observed` set, the sample is conditioned on the given children:
    /// they are validated against the declared products and returned
    /// unchanged (no randomness is consumed).
    fn sample(
        &self,
        parent: &Node,
        rng: &mut dyn RngCore,
        store: &ParamStore,
        observed: Option<Vec<Node>>,
    ) -> Result<Vec<Node>, GrammarError>;

    /// Log-probability that this rule, fired from `parent`, generates
    /// exactly `children`. Wrong child count or class scores -inf.
    fn score(
        &self,
        parent: &Node,
        children: &[&Node],
        store: &ParamStore,
    ) -> Result<f64, GrammarError>;

    /// Like [`score`](Self::score), also accumulating d(log-prob)/d(params)
    /// for this rule's learned parameters into `grads`.
    fn score_grad(
        &self,
        parent: &Node,
        children: &[&Node],
        store: &ParamStore,
        grads: &mut GradientMap,
    ) -> Result<f64, GrammarError> {
        let _ = grads;
        self.score(parent, children, store)
    }
}

/// Production rule drawing a relative pose offset from a learned Normal
///
/// The offset distribution is diagonal (independent per coordinate). An
/// optional fixed anchor pose sits between the parent and the sampled
/// offset: the child lands at `chain(chain(parent, anchor), offset)`. Table
/// place-setting slots use the anchor for their fixed position on the rim.
pub struct OffsetRule {
    name: String,
    product_classes: [String; 1],
    mean_key: ParamKey,
    scale_key: ParamKey,
    anchor: Option<Pose>,
    factory: ChildFactory,
}

impl OffsetRule {
    pub fn new(
        name: impl Into<String>,
        product_class: impl Into<String>,
        mean_key: ParamKey,
        scale_key: ParamKey,
        factory: ChildFactory,
    ) -> Self {
        Self {
            name: name.into(),
            product_classes: [product_class.into()],
            mean_key,
            scale_key,
            anchor: None,
            factory,
        }
    }

    pub fn with_anchor(mut self, anchor: Pose) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// The frame the sampled offset is expressed in
    fn frame(&self, parent: &Node) -> Pose {
        match &self.anchor {
            Some(anchor) => parent.pose().chain(anchor),
            None => *parent.pose(),
        }
    }

    fn offset_dist(&self, parent: &Node, store: &ParamStore) -> Result<DiagonalNormal, GrammarError> {
        let dof = parent.pose().dof();
        let mean = store.value_checked(&self.mean_key, dof)?;
        let scale = store.value_checked(&self.scale_key, dof)?;
        Ok(DiagonalNormal::new(mean, scale))
    }

    /// Invert the forward chaining to recover the relative offset implied
    /// by an observed absolute child pose.
    fn recover_rel_offset(&self, parent: &Node, abs_pose: &Pose) -> Vec<f64> {
        self.frame(parent).invert().chain(abs_pose).to_vec()
    }

    fn check_observed(&self, children: &[&Node]) -> bool {
        children.len() == 1 && children[0].class_name() == self.product_classes[0]
    }
}

impl ProductionRule for OffsetRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_classes(&self) -> &[String] {
        &self.product_classes
    }

    fn sample(
        &self,
        parent: &Node,
        rng: &mut dyn RngCore,
        store: &ParamStore,
        observed: Option<Vec<Node>>,
    ) -> Result<Vec<Node>, GrammarError> {
        if let Some(observed) = observed {
            let refs: Vec<&Node> = observed.iter().collect();
            if !self.check_observed(&refs) {
                return Err(GrammarError::ObservedChildMismatch {
                    rule: self.name.clone(),
                });
            }
            return Ok(observed);
        }

        let dist = self.offset_dist(parent, store)?;
        let rel = dist.sample(rng);
        let frame = self.frame(parent);
        let abs_pose = frame.chain(&frame.with_coords(&rel));

        let child_name = format!("{}_{}", self.name, self.product_classes[0]);
        let child = (self.factory)(&child_name, abs_pose, store)?;
        Ok(vec![child])
    }

    fn score(
        &self,
        parent: &Node,
        children: &[&Node],
        store: &ParamStore,
    ) -> Result<f64, GrammarError> {
        if !self.check_observed(children) {
            return Ok(f64::NEG_INFINITY);
        }
        let rel = self.recover_rel_offset(parent, children[0].pose());
        Ok(self.offset_dist(parent, store)?.log_prob(&rel))
    }

    fn score_grad(
        &self,
        parent: &Node,
        children: &[&Node],
        store: &ParamStore,
        grads: &mut GradientMap,
    ) -> Result<f64, GrammarError> {
        if !self.check_observed(children) {
            return Ok(f64::NEG_INFINITY);
        }
        let rel = self.recover_rel_offset(parent, children[0].pose());
        let dist = self.offset_dist(parent, store)?;
        let (d_mean, d_scale) = dist.log_prob_grad(&rel);
        grads.accumulate(&self.mean_key, &d_mean);
        grads.accumulate(&self.scale_key, &d_scale);
        Ok(dist.log_prob(&rel))
    }
}
