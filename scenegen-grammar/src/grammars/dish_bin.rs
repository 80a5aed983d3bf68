//! Dish-bin grammar (spatial family)
//!
//! A DishBin root independently produces up to four mugs and four plates,
//! each dropped near the bin center with a broad orientation distribution.
//! Terminal poses serialize as 7-float quaternion + xyz records.

use crate::error::GrammarError;
use crate::nodes::{Node, TerminalPayload};
use crate::params::{ConstraintKind, ParamKey, ParamStore};
use crate::pose::Pose;
use crate::rules::{ChildFactory, OffsetRule, ProductionRule};
use crate::tree::{ExpansionConfig, ParseTree};
use rand::RngCore;
use std::sync::Arc;

pub const DISH_BIN_CLASS: &str = "dish_bin";

pub const NUM_SLOTS_PER_TYPE: usize = 4;

struct DishSpec {
    slot: &'static str,
    class: &'static str,
    offset_mean: [f64; 6],
    offset_scale: [f64; 6],
}

const DISH_SPECS: &[DishSpec] = &[
    DishSpec {
        slot: "mug",
        class: "mug_1",
        offset_mean: [0.0, 0.0, 0.1, 0.0, 0.0, 0.0],
        offset_scale: [0.05, 0.05, 0.05, 2.0, 2.0, 2.0],
    },
    DishSpec {
        slot: "plate",
        class: "plate_11in",
        offset_mean: [0.0, 0.0, 0.1, 0.0, 0.0, 0.0],
        offset_scale: [0.05, 0.05, 0.05, 2.0, 2.0, 2.0],
    },
];

fn mean_key(slot: &str) -> ParamKey {
    ParamKey::new(DISH_BIN_CLASS, slot, "offset_mean")
}

fn scale_key(slot: &str) -> ParamKey {
    ParamKey::new(DISH_BIN_CLASS, slot, "offset_scale")
}

fn probs_key() -> ParamKey {
    ParamKey::new(DISH_BIN_CLASS, "root", "production_probs")
}

/// Register every learned parameter of this grammar
pub fn register(store: &mut ParamStore) {
    for spec in DISH_SPECS {
        store.register(mean_key(spec.slot), &spec.offset_mean, ConstraintKind::Unconstrained);
        store.register(scale_key(spec.slot), &spec.offset_scale, ConstraintKind::Positive);
    }
    store.register(
        probs_key(),
        &[0.5; NUM_SLOTS_PER_TYPE * 2],
        ConstraintKind::UnitInterval,
    );
}

fn terminal_factory(spec: &'static DishSpec) -> ChildFactory {
    Arc::new(move |name: &str, pose, _store: &ParamStore| {
        Ok(Node::terminal(
            name,
            pose,
            TerminalPayload {
                class: spec.class.to_string(),
                params: vec![],
                params_names: vec![],
                asset: None,
                color: None,
            },
        ))
    })
}

/// Build the DishBin root node
pub fn dish_bin_root(store: &ParamStore) -> Result<Node, GrammarError> {
    let mut rules: Vec<Box<dyn ProductionRule>> = Vec::new();
    // Interleave mug/plate slots so the Bernoulli vector layout matches
    // slot numbering: mug_000, plate_000, mug_001, ...
    for k in 0..NUM_SLOTS_PER_TYPE {
        for spec in DISH_SPECS {
            rules.push(Box::new(OffsetRule::new(
                format!("dish_bin_prod_{}_{:03}", spec.slot, k),
                spec.class.to_string(),
                mean_key(spec.slot),
                scale_key(spec.slot),
                terminal_factory(spec),
            )));
        }
    }
    Ok(Node::independent_set(
        DISH_BIN_CLASS,
        Pose::spatial(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
        rules,
        probs_key(),
        store,
    )?
    .into_root())
}

/// Sample one dish-bin parse tree
pub fn sample_scene(
    store: &ParamStore,
    rng: &mut dyn RngCore,
    config: &ExpansionConfig,
) -> Result<ParseTree, GrammarError> {
    ParseTree::sample(dish_bin_root(store)?, rng, store, config)
}
