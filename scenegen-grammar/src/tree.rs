//! Parse trees: the realized recursive expansion of a grammar root
//!
//! Expansion keeps a breadth-first work-list so production steps happen in
//! a fixed, deterministic order: random draws for a given node always occur
//! in the same relative sequence across samples, and object numbering in
//! the rendered scene is stable run-to-run.
//!
//! Node and rule definitions are responsible for bounding their own
//! fan-out (every node declares `max_children`); the expansion adds a hard
//! production-step cap as a safety net and fails with a distinguished
//! "grammar did not terminate" error if it is hit.

use crate::error::{FitError, GrammarError};
use crate::nodes::Node;
use crate::params::{GradientMap, ParamStore};
use crate::scene::SceneRecord;
use rand::RngCore;
use std::collections::VecDeque;

/// One fired rule inside a production step
#[derive(Debug, Clone)]
pub struct RuleApplication {
    pub rule_index: usize,
    /// Indices of the produced children in the tree's node list
    pub children: Vec<usize>,
}

/// One node's production: which rules fired and what they produced
#[derive(Debug, Clone)]
pub struct ProductionStep {
    pub node: usize,
    pub applications: Vec<RuleApplication>,
}

/// Expansion limits
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Hard cap on the number of production steps
    pub max_production_steps: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_production_steps: 1000,
        }
    }
}

/// Supplies observed productions during constrained expansion
///
/// For each non-terminal node the resolver returns the observed rule
/// selection (ascending rule indices) with the observed children per rule.
pub trait ObservedResolver {
    fn resolve(&self, node: &Node) -> Result<Vec<(usize, Vec<Node>)>, FitError>;
}

/// The acyclic result of expanding a root node until only terminals remain
///
/// Trees are produced fresh per sample and never mutated, only scored or
/// rendered to the scene format.
#[derive(Debug)]
pub struct ParseTree {
    pub nodes: Vec<Node>,
    pub steps: Vec<ProductionStep>,
    /// Terminal node indices in production order
    pub terminals: Vec<usize>,
}

impl ParseTree {
    /// Expand `root` by sampling every production choice
    pub fn sample(
        root: Node,
        rng: &mut dyn RngCore,
        store: &ParamStore,
        config: &ExpansionConfig,
    ) -> Result<ParseTree, GrammarError> {
        Self::expand(root, config, |node, rng| {
            let selected = node.sample_production_rules(rng, store, None)?;
            let mut out = Vec::with_capacity(selected.len());
            for rule_index in selected {
                let children = node.rule(rule_index).sample(node, rng, store, None)?;
                out.push((rule_index, children));
            }
            Ok(out)
        }, rng)
        .map_err(|e| match e {
            FitError::Grammar(g) => g,
            // Sampling mode only produces grammar errors
            other => unreachable!("unexpected error in sampling expansion: {}", other),
        })
    }

    /// Expand `root` with every production choice forced to match the
    /// observed structure supplied by `resolver` (fitting mode)
    pub fn sample_observed(
        root: Node,
        resolver: &dyn ObservedResolver,
        rng: &mut dyn RngCore,
        store: &ParamStore,
        config: &ExpansionConfig,
    ) -> Result<ParseTree, FitError> {
        Self::expand(root, config, |node, rng| {
            let observed = resolver.resolve(node)?;
            let indices: Vec<usize> = observed.iter().map(|(i, _)| *i).collect();
            node.sample_production_rules(rng, store, Some(&indices))
                .map_err(FitError::Grammar)?;

            let mut out = Vec::with_capacity(observed.len());
            for (rule_index, children) in observed {
                let children = node
                    .rule(rule_index)
                    .sample(node, rng, store, Some(children))
                    .map_err(FitError::Grammar)?;
                out.push((rule_index, children));
            }
            Ok(out)
        }, rng)
    }

    fn expand<F>(
        root: Node,
        config: &ExpansionConfig,
        mut produce: F,
        rng: &mut dyn RngCore,
    ) -> Result<ParseTree, FitError>
    where
        F: FnMut(&Node, &mut dyn RngCore) -> Result<Vec<(usize, Vec<Node>)>, FitError>,
    {
        let mut nodes = vec![root];
        let mut steps: Vec<ProductionStep> = Vec::new();
        let mut terminals: Vec<usize> = Vec::new();
        let mut queue: VecDeque<usize> = VecDeque::from([0]);

        while let Some(index) = queue.pop_front() {
            if nodes[index].is_terminal() {
                terminals.push(index);
                continue;
            }
            if steps.len() >= config.max_production_steps {
                return Err(FitError::Grammar(GrammarError::DidNotTerminate {
                    limit: config.max_production_steps,
                }));
            }

            let produced = produce(&nodes[index], rng)?;

            let mut applications = Vec::with_capacity(produced.len());
            for (rule_index, children) in produced {
                let mut child_indices = Vec::with_capacity(children.len());
                for child in children {
                    let child_index = nodes.len();
                    nodes.push(child);
                    queue.push_back(child_index);
                    child_indices.push(child_index);
                }
                applications.push(RuleApplication {
                    rule_index,
                    children: child_indices,
                });
            }
            steps.push(ProductionStep {
                node: index,
                applications,
            });
        }

        Ok(ParseTree {
            nodes,
            steps,
            terminals,
        })
    }

    /// Local log-probability of one recorded production step under the
    /// current parameters
    fn step_log_prob(
        &self,
        step: &ProductionStep,
        store: &ParamStore,
        mut grads: Option<&mut GradientMap>,
    ) -> Result<f64, GrammarError> {
        let node = &self.nodes[step.node];
        let selected: Vec<usize> = step.applications.iter().map(|a| a.rule_index).collect();

        let mut total = match grads.as_mut() {
            Some(g) => node.score_production_rules_grad(&selected, store, g)?,
            None => node.score_production_rules(&selected, store)?,
        };

        for application in &step.applications {
            let children: Vec<&Node> = application
                .children
                .iter()
                .map(|&c| &self.nodes[c])
                .collect();
            let rule = node.rule(application.rule_index);
            total += match grads.as_mut() {
                Some(g) => rule.score_grad(node, &children, store, g)?,
                None => rule.score(node, &children, store)?,
            };
        }
        Ok(total)
    }

    /// Total joint log-probability: the sum of each visited node's local
    /// production log-probability (terminals carry no intrinsic prior here)
    pub fn log_prob(&self, store: &ParamStore) -> Result<f64, GrammarError> {
        let mut total = 0.0;
        for step in &self.steps {
            total += self.step_log_prob(step, store, None)?;
        }
        Ok(total)
    }

    /// Per-step local scores, aligned with `self.steps`
    pub fn log_prob_by_step(&self, store: &ParamStore) -> Result<Vec<f64>, GrammarError> {
        self.steps
            .iter()
            .map(|step| self.step_log_prob(step, store, None))
            .collect()
    }

    /// Total joint log-probability plus d(log-prob)/d(params) for every
    /// learned parameter touched by this tree
    pub fn log_prob_grad(
        &self,
        store: &ParamStore,
        grads: &mut GradientMap,
    ) -> Result<f64, GrammarError> {
        let mut total = 0.0;
        for step in &self.steps {
            total += self.step_log_prob(step, store, Some(grads))?;
        }
        Ok(total)
    }

    /// Render the terminal set to the scene record format, in production
    /// order
    pub fn to_scene_record(&self) -> Result<SceneRecord, crate::error::SceneError> {
        let objects = self
            .terminals
            .iter()
            .map(|&t| self.nodes[t].to_scene_object())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SceneRecord::new(objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::TerminalPayload;
    use crate::params::{ConstraintKind, ParamKey};
    use crate::pose::Pose;
    use crate::rules::{ChildFactory, OffsetRule, ProductionRule};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    fn terminal_factory(class: &str) -> ChildFactory {
        let class = class.to_string();
        Arc::new(move |name: &str, pose, _store: &ParamStore| {
            Ok(Node::terminal(
                name,
                pose,
                TerminalPayload {
                    class: class.clone(),
                    params: vec![0.1],
                    params_names: vec!["radius".into()],
                    asset: None,
                    color: None,
                },
            ))
        })
    }

    fn offset_rule(store: &mut ParamStore, slot: &str, class: &str) -> Box<dyn ProductionRule> {
        let mean_key = store.register(
            ParamKey::new("tree_tests", slot, "offset_mean"),
            &[0.0, 0.1, 0.0],
            ConstraintKind::Unconstrained,
        );
        let scale_key = store.register(
            ParamKey::new("tree_tests", slot, "offset_scale"),
            &[0.05, 0.05, 0.1],
            ConstraintKind::Positive,
        );
        Box::new(OffsetRule::new(
            format!("rule_{}", slot),
            class.to_string(),
            mean_key,
            scale_key,
            terminal_factory(class),
        ))
    }

    fn two_level_root(store: &mut ParamStore) -> Node {
        // Root And node producing an intermediate Or node that in turn
        // produces one of two terminals. Register the inner rules'
        // parameters up front; the factory rebuilds the rules from these
        // keys at expansion time.
        let _ = offset_rule(store, "inner_a", "plate");
        let _ = offset_rule(store, "inner_b", "cup");
        let inner_factory: ChildFactory = Arc::new(move |name: &str, pose, _store: &ParamStore| {
            let rules = vec![
                Box::new(OffsetRule::new(
                    "rule_inner_a",
                    "plate",
                    ParamKey::new("tree_tests", "inner_a", "offset_mean"),
                    ParamKey::new("tree_tests", "inner_a", "offset_scale"),
                    terminal_factory("plate"),
                )) as Box<dyn ProductionRule>,
                Box::new(OffsetRule::new(
                    "rule_inner_b",
                    "cup",
                    ParamKey::new("tree_tests", "inner_b", "offset_mean"),
                    ParamKey::new("tree_tests", "inner_b", "offset_scale"),
                    terminal_factory("cup"),
                )) as Box<dyn ProductionRule>,
            ];
            Node::or(name, pose, rules, &[0.5, 0.5]).map(|n| n.with_class("chooser"))
        });

        let mean_key = store.register(
            ParamKey::new("tree_tests", "root", "offset_mean"),
            &[0.0, 0.0, 0.0],
            ConstraintKind::Unconstrained,
        );
        let scale_key = store.register(
            ParamKey::new("tree_tests", "root", "offset_scale"),
            &[0.02, 0.02, 0.1],
            ConstraintKind::Positive,
        );
        let root_rule = Box::new(OffsetRule::new(
            "root_rule",
            "chooser",
            mean_key,
            scale_key,
            inner_factory,
        )) as Box<dyn ProductionRule>;

        Node::and("root", Pose::planar(0.5, 0.5, 0.0), vec![root_rule])
            .unwrap()
            .into_root()
    }

    #[test]
    fn test_expansion_terminates_with_terminals() {
        let mut store = ParamStore::new();
        let root = two_level_root(&mut store);
        let mut rng = ChaCha8Rng::seed_from_u64(17);

        let tree =
            ParseTree::sample(root, &mut rng, &store, &ExpansionConfig::default()).unwrap();
        assert_eq!(tree.terminals.len(), 1);
        assert_eq!(tree.steps.len(), 2); // root production + chooser production
        assert!(tree.nodes[tree.terminals[0]].is_terminal());
    }

    #[test]
    fn test_expansion_is_deterministic_per_seed() {
        let mut store = ParamStore::new();
        let root1 = two_level_root(&mut store);
        let root2 = two_level_root(&mut store);

        let mut rng1 = ChaCha8Rng::seed_from_u64(99);
        let mut rng2 = ChaCha8Rng::seed_from_u64(99);
        let t1 = ParseTree::sample(root1, &mut rng1, &store, &ExpansionConfig::default()).unwrap();
        let t2 = ParseTree::sample(root2, &mut rng2, &store, &ExpansionConfig::default()).unwrap();

        let s1 = t1.to_scene_record().unwrap();
        let s2 = t2.to_scene_record().unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_joint_log_prob_decomposes_over_steps() {
        let mut store = ParamStore::new();
        let root = two_level_root(&mut store);
        let mut rng = ChaCha8Rng::seed_from_u64(23);

        let tree =
            ParseTree::sample(root, &mut rng, &store, &ExpansionConfig::default()).unwrap();
        let total = tree.log_prob(&store).unwrap();
        let by_step = tree.log_prob_by_step(&store).unwrap();

        assert!(total.is_finite());
        assert_eq!(by_step.len(), tree.steps.len());
        assert_abs_diff_eq!(total, by_step.iter().sum::<f64>(), epsilon = 1e-12);
    }

    #[test]
    fn test_sampled_tree_scores_finite() {
        // score(sample()) must always be finite: the sampler and the scorer
        // agree on what is representable.
        let mut store = ParamStore::new();
        for seed in 0..20 {
            let root = two_level_root(&mut store);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let tree =
                ParseTree::sample(root, &mut rng, &store, &ExpansionConfig::default()).unwrap();
            assert!(tree.log_prob(&store).unwrap().is_finite());
        }
    }

    #[test]
    fn test_iteration_cap_fires() {
        let mut store = ParamStore::new();
        let root = two_level_root(&mut store);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let config = ExpansionConfig {
            max_production_steps: 1,
        };
        let result = ParseTree::sample(root, &mut rng, &store, &config);
        assert!(matches!(
            result,
            Err(GrammarError::DidNotTerminate { limit: 1 })
        ));
    }

    #[test]
    fn test_grad_touches_only_visited_params() {
        let mut store = ParamStore::new();
        let root = two_level_root(&mut store);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let tree =
            ParseTree::sample(root, &mut rng, &store, &ExpansionConfig::default()).unwrap();

        let mut grads = GradientMap::new();
        let total = tree.log_prob_grad(&store, &mut grads).unwrap();
        assert!(total.is_finite());
        assert!(!grads.is_empty());
        // Only one of the two inner rules fired, so exactly one inner mean
        // shows up in the touched set
        let inner_touched = grads
            .keys()
            .filter(|k| k.slot.starts_with("inner_") && k.field == "offset_mean")
            .count();
        assert_eq!(inner_touched, 1);
    }
}
