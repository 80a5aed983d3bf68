//! Table-setting grammar (planar family)
//!
//! A Table root holds four place-setting slots spaced around its rim; each
//! slot independently may or may not hold a PlaceSetting (Bernoulli 0.5).
//! A PlaceSetting is a covarying set over plate / cup / fork production
//! rules, hint-weighted toward the combinations that actually occur
//! together on real tables.

use crate::error::{FitError, GrammarError};
use crate::nodes::{Node, TerminalPayload};
use crate::params::{ConstraintKind, ParamKey, ParamStore};
use crate::pose::{PlanarPose, Pose};
use crate::rules::{ChildFactory, OffsetRule, ProductionRule};
use crate::scene::{SceneObject, SceneRecord};
use crate::tree::{ExpansionConfig, ObservedResolver, ParseTree};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::Arc;

pub const TABLE_CLASS: &str = "table";
pub const PLACE_SETTING_CLASS: &str = "place_setting";

pub const NUM_PLACE_SETTING_SLOTS: usize = 4;

/// One object type a place setting can produce
struct ObjectSpec {
    /// Rule slot name (left/right variants of the same class get their own
    /// slots)
    slot: &'static str,
    class: &'static str,
    params: &'static [f64],
    params_names: &'static [&'static str],
    asset: &'static str,
    offset_mean: [f64; 3],
    offset_scale: [f64; 3],
}

const OBJECT_SPECS: &[ObjectSpec] = &[
    ObjectSpec {
        slot: "plate",
        class: "plate",
        params: &[0.2],
        params_names: &["radius"],
        asset: "table_setting_assets/plate_red.png",
        offset_mean: [0.0, 0.16, 0.0],
        offset_scale: [0.01, 0.01, 3.0],
    },
    ObjectSpec {
        slot: "cup",
        class: "cup",
        params: &[0.05],
        params_names: &["radius"],
        asset: "table_setting_assets/cup_water.png",
        offset_mean: [0.0, 0.16 + 0.15, 0.0],
        offset_scale: [0.05, 0.01, 3.0],
    },
    ObjectSpec {
        slot: "left_fork",
        class: "fork",
        params: &[0.02, 0.14],
        params_names: &["width", "height"],
        asset: "table_setting_assets/fork.png",
        offset_mean: [-0.15, 0.16, 0.0],
        offset_scale: [0.01, 0.01, 0.01],
    },
];

fn object_mean_key(spec_slot: &str) -> ParamKey {
    ParamKey::new(PLACE_SETTING_CLASS, spec_slot, "offset_mean")
}

fn object_scale_key(spec_slot: &str) -> ParamKey {
    ParamKey::new(PLACE_SETTING_CLASS, spec_slot, "offset_scale")
}

fn set_weights_key() -> ParamKey {
    ParamKey::new(PLACE_SETTING_CLASS, "set", "weights")
}

fn table_radius_key() -> ParamKey {
    ParamKey::new(TABLE_CLASS, "root", "radius")
}

fn slot_mean_key() -> ParamKey {
    ParamKey::new(TABLE_CLASS, "slots", "offset_mean")
}

fn slot_scale_key() -> ParamKey {
    ParamKey::new(TABLE_CLASS, "slots", "offset_scale")
}

fn slot_probs_key() -> ParamKey {
    ParamKey::new(TABLE_CLASS, "slots", "production_probs")
}

/// Register every learned parameter of this grammar.
///
/// Must run before any node construction; factories and the fitting loop
/// only ever read the store afterwards.
pub fn register(store: &mut ParamStore) {
    store.register(table_radius_key(), &[0.45], ConstraintKind::Positive);
    store.register(
        slot_mean_key(),
        &[0.0, 0.0, FRAC_PI_2],
        ConstraintKind::Unconstrained,
    );
    store.register(
        slot_scale_key(),
        &[0.01, 0.01, 0.1],
        ConstraintKind::Positive,
    );
    store.register(
        slot_probs_key(),
        &[0.5; NUM_PLACE_SETTING_SLOTS],
        ConstraintKind::UnitInterval,
    );
    for spec in OBJECT_SPECS {
        store.register(
            object_mean_key(spec.slot),
            &spec.offset_mean,
            ConstraintKind::Unconstrained,
        );
        store.register(
            object_scale_key(spec.slot),
            &spec.offset_scale,
            ConstraintKind::Positive,
        );
    }

    // Weight the semantically sensible combinations; everything else gets
    // nothing (rule indices: plate 0, cup 1, left_fork 2)
    let hints: &[(&[usize], f64)] = &[(&[0, 2], 1.0), (&[0, 1], 1.0), (&[0], 1.0)];
    register_covarying_weights(store, hints, 0.0);
}

fn register_covarying_weights(store: &mut ParamStore, hints: &[(&[usize], f64)], remaining: f64) {
    // Reuse the covarying-set construction for its weight table build, then
    // drop the throwaway node; registration is idempotent.
    let rules = object_rules(&store.clone()).unwrap_or_default();
    if rules.is_empty() {
        return;
    }
    let _ = Node::covarying_set(
        "place_setting_registration",
        Pose::planar(0.0, 0.0, 0.0),
        rules,
        hints,
        remaining,
        set_weights_key(),
        store,
    );
}

fn terminal_factory(spec: &'static ObjectSpec) -> ChildFactory {
    Arc::new(move |name: &str, pose, _store: &ParamStore| {
        Ok(Node::terminal(
            name,
            pose,
            TerminalPayload {
                class: spec.class.to_string(),
                params: spec.params.to_vec(),
                params_names: spec.params_names.iter().map(|s| s.to_string()).collect(),
                asset: Some(spec.asset.to_string()),
                color: None,
            },
        ))
    })
}

fn object_rules(store: &ParamStore) -> Result<Vec<Box<dyn ProductionRule>>, GrammarError> {
    OBJECT_SPECS
        .iter()
        .map(|spec| {
            store.value_checked(&object_mean_key(spec.slot), 3)?;
            store.value_checked(&object_scale_key(spec.slot), 3)?;
            Ok(Box::new(OffsetRule::new(
                format!("place_setting_prod_{}", spec.slot),
                spec.class.to_string(),
                object_mean_key(spec.slot),
                object_scale_key(spec.slot),
                terminal_factory(spec),
            )) as Box<dyn ProductionRule>)
        })
        .collect()
}

/// Build a PlaceSetting node at the given pose
pub fn place_setting_node(
    name: &str,
    pose: Pose,
    store: &ParamStore,
) -> Result<Node, GrammarError> {
    let rules = object_rules(store)?;
    Ok(
        Node::covarying_set_from_store(name, pose, rules, set_weights_key(), store)?
            .with_class(PLACE_SETTING_CLASS),
    )
}

fn place_setting_factory() -> ChildFactory {
    Arc::new(|name: &str, pose, store: &ParamStore| place_setting_node(name, pose, store))
}

/// Fixed pose of slot `k` on the table rim, in the table frame
fn slot_anchor(radius: f64, k: usize) -> PlanarPose {
    let angle = (k as f64 / NUM_PLACE_SETTING_SLOTS as f64) * 2.0 * PI;
    PlanarPose::new(radius * angle.cos(), radius * angle.sin(), angle)
}

/// Build the Table root node
pub fn table_root(store: &ParamStore) -> Result<Node, GrammarError> {
    let radius = store.value_checked(&table_radius_key(), 1)?[0];
    let rules: Vec<Box<dyn ProductionRule>> = (0..NUM_PLACE_SETTING_SLOTS)
        .map(|k| {
            Box::new(
                OffsetRule::new(
                    format!("table_prod_{:03}", k),
                    PLACE_SETTING_CLASS,
                    slot_mean_key(),
                    slot_scale_key(),
                    place_setting_factory(),
                )
                .with_anchor(Pose::Planar(slot_anchor(radius, k))),
            ) as Box<dyn ProductionRule>
        })
        .collect();

    Ok(Node::independent_set(
        TABLE_CLASS,
        Pose::planar(0.5, 0.5, 0.0),
        rules,
        slot_probs_key(),
        store,
    )?
    .into_root())
}

/// Sample one table-setting parse tree
pub fn sample_scene(
    store: &ParamStore,
    rng: &mut dyn RngCore,
    config: &ExpansionConfig,
) -> Result<ParseTree, GrammarError> {
    ParseTree::sample(table_root(store)?, rng, store, config)
}

// ----------------------------------------------------------------------
// Scene -> observed parse tree association
// ----------------------------------------------------------------------

/// Greedy nearest-slot association of a flat scene record to the grammar
/// structure: each object is assigned to the closest slot, and each
/// occupied slot's latent place-setting pose is estimated at the slot's
/// nominal pose.
pub struct TableSettingAssembler {
    pub config: ExpansionConfig,
}

impl Default for TableSettingAssembler {
    fn default() -> Self {
        Self {
            config: ExpansionConfig::default(),
        }
    }
}

struct SlotObservation {
    ps_pose: Pose,
    /// (object rule index, scene object), ascending by rule index
    objects: Vec<(usize, SceneObject)>,
}

struct TableResolver<'a> {
    store: &'a ParamStore,
    slots: Vec<Option<SlotObservation>>,
}

fn rule_index_for_class(class: &str) -> Option<usize> {
    OBJECT_SPECS.iter().position(|spec| spec.class == class)
}

fn object_pose(obj: &SceneObject) -> Result<PlanarPose, FitError> {
    if obj.pose.len() != 3 {
        return Err(FitError::Unparseable(format!(
            "object '{}' is not planar",
            obj.class
        )));
    }
    Ok(PlanarPose::from_slice(&obj.pose))
}

impl TableSettingAssembler {
    fn associate(
        &self,
        scene: &SceneRecord,
        store: &ParamStore,
    ) -> Result<Vec<Option<SlotObservation>>, FitError> {
        let table_pose = PlanarPose::new(0.5, 0.5, 0.0);
        let radius = store.value_checked(&table_radius_key(), 1)?[0];
        let slot_mean = store.value_checked(&slot_mean_key(), 3)?;

        // Nominal world pose of each slot's place setting
        let nominal: Vec<PlanarPose> = (0..NUM_PLACE_SETTING_SLOTS)
            .map(|k| {
                table_pose
                    .chain(&slot_anchor(radius, k))
                    .chain(&PlanarPose::from_slice(&slot_mean))
            })
            .collect();

        let mut assigned: Vec<Vec<SceneObject>> = vec![Vec::new(); NUM_PLACE_SETTING_SLOTS];
        for obj in &scene.objects {
            let pose = object_pose(obj)?;
            let nearest = (0..NUM_PLACE_SETTING_SLOTS)
                .min_by(|&a, &b| {
                    let da = (pose.x - nominal[a].x).hypot(pose.z - nominal[a].z);
                    let db = (pose.x - nominal[b].x).hypot(pose.z - nominal[b].z);
                    da.total_cmp(&db)
                })
                .expect("slot count is nonzero");
            assigned[nearest].push(obj.clone());
        }

        let mut slots = Vec::with_capacity(NUM_PLACE_SETTING_SLOTS);
        for (k, objects) in assigned.into_iter().enumerate() {
            if objects.is_empty() {
                slots.push(None);
                continue;
            }
            let mut with_rules: Vec<(usize, SceneObject)> = Vec::with_capacity(objects.len());
            for obj in objects {
                let rule = rule_index_for_class(&obj.class).ok_or_else(|| {
                    FitError::Unparseable(format!("no production rule for class '{}'", obj.class))
                })?;
                if with_rules.iter().any(|(r, _)| *r == rule) {
                    return Err(FitError::Unparseable(format!(
                        "two '{}' objects assigned to slot {}",
                        obj.class, k
                    )));
                }
                with_rules.push((rule, obj));
            }
            with_rules.sort_by_key(|(r, _)| *r);

            // The place-setting pose is a latent; estimate it at the slot's
            // nominal pose. Estimating it from the assigned objects instead
            // would cancel their recovered offsets against the current mean
            // and starve the object-offset parameters of gradient.
            slots.push(Some(SlotObservation {
                ps_pose: Pose::Planar(nominal[k]),
                objects: with_rules,
            }));
        }
        Ok(slots)
    }

    /// Associate a scene and expand the grammar against it, yielding a
    /// scored-able observed parse tree
    pub fn assemble(
        &self,
        scene: &SceneRecord,
        store: &ParamStore,
    ) -> Result<ParseTree, FitError> {
        let slots = self.associate(scene, store)?;
        let resolver = TableResolver { store, slots };
        let root = table_root(store)?;
        // Observed-mode expansion consumes no randomness
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        ParseTree::sample_observed(root, &resolver, &mut rng, store, &self.config)
    }
}

impl ObservedResolver for TableResolver<'_> {
    fn resolve(&self, node: &Node) -> Result<Vec<(usize, Vec<Node>)>, FitError> {
        if node.class_name() == TABLE_CLASS {
            let mut out = Vec::new();
            for (k, slot) in self.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    let child = place_setting_node(&format!("slot_{}", k), slot.ps_pose, self.store)
                        .map_err(FitError::Grammar)?;
                    out.push((k, vec![child]));
                }
            }
            Ok(out)
        } else if node.class_name() == PLACE_SETTING_CLASS {
            let k: usize = node
                .name()
                .strip_prefix("slot_")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    FitError::Unparseable(format!("unexpected place setting '{}'", node.name()))
                })?;
            let slot = self.slots[k]
                .as_ref()
                .ok_or_else(|| FitError::Unparseable(format!("slot {} has no observation", k)))?;
            slot.objects
                .iter()
                .map(|(rule, obj)| {
                    let spec = &OBJECT_SPECS[*rule];
                    let pose = object_pose(obj)?;
                    let child = Node::terminal(
                        format!("slot_{}_{}", k, spec.slot),
                        Pose::Planar(pose),
                        TerminalPayload {
                            class: obj.class.clone(),
                            params: obj.params.clone(),
                            params_names: obj.params_names.clone(),
                            asset: obj.img_path.clone(),
                            color: obj.color,
                        },
                    );
                    Ok((*rule, vec![child]))
                })
                .collect()
        } else {
            Err(FitError::Unparseable(format!(
                "resolver reached unexpected node class '{}'",
                node.class_name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn fresh_store() -> ParamStore {
        let mut store = ParamStore::new();
        register(&mut store);
        store
    }

    #[test]
    fn test_covarying_weights_cover_hinted_combinations_only() {
        let store = fresh_store();
        let weights = store.value(&set_weights_key()).unwrap();
        assert_eq!(weights.len(), 8);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        // Hinted combinations split the mass evenly; unhinted ones are
        // floored near zero
        assert_abs_diff_eq!(weights[0b001], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(weights[0b011], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(weights[0b101], 1.0 / 3.0, epsilon = 1e-6);
        assert!(weights[0b010] < 1e-9);
    }

    #[test]
    fn test_sampled_scene_objects_are_planar() {
        let store = fresh_store();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let tree = sample_scene(&store, &mut rng, &ExpansionConfig::default()).unwrap();
        let record = tree.to_scene_record().unwrap();
        for obj in &record.objects {
            assert_eq!(obj.pose.len(), 3);
            assert!(["plate", "cup", "fork"].contains(&obj.class.as_str()));
        }
    }

    #[test]
    fn test_place_setting_count_statistic() {
        // With four independent slots at probability 0.5, the mean number
        // of place settings over many samples must approach 2.0.
        let store = fresh_store();
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        let n = 10_000;
        let mut total_settings = 0usize;
        for _ in 0..n {
            let tree = sample_scene(&store, &mut rng, &ExpansionConfig::default()).unwrap();
            let settings = tree
                .nodes
                .iter()
                .filter(|node| node.class_name() == PLACE_SETTING_CLASS)
                .count();
            total_settings += settings;
        }
        let mean = total_settings as f64 / n as f64;
        // Std of the mean is sqrt(4 * 0.25 / 10000) = 0.01; allow 5 sigma
        assert!((mean - 2.0).abs() < 0.05, "mean place settings = {}", mean);
    }

    #[test]
    fn test_sampled_tree_log_prob_finite() {
        let store = fresh_store();
        for seed in 0..10 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let tree = sample_scene(&store, &mut rng, &ExpansionConfig::default()).unwrap();
            assert!(tree.log_prob(&store).unwrap().is_finite());
        }
    }

    #[test]
    fn test_assemble_roundtrip_scores_finite() {
        let store = fresh_store();
        let assembler = TableSettingAssembler::default();
        let mut assembled = 0;
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let tree = sample_scene(&store, &mut rng, &ExpansionConfig::default()).unwrap();
            let record = tree.to_scene_record().unwrap();
            if record.objects.is_empty() {
                continue;
            }
            // Greedy association can mis-handle unusual layouts (e.g. two
            // plates pulled to the same slot); those fail loudly and are
            // skipped here.
            if let Ok(observed) = assembler.assemble(&record, &store) {
                let lp = observed.log_prob(&store).unwrap();
                assert!(lp.is_finite());
                assert_eq!(observed.terminals.len(), record.objects.len());
                assembled += 1;
            }
        }
        assert!(assembled > 5, "only {} scenes assembled", assembled);
    }

    #[test]
    fn test_assemble_recovers_exact_structure_for_nominal_scene() {
        // Build a scene by hand at the nominal slot-0 pose: one plate and
        // one fork. Association must put both in slot 0 with the plate
        // first.
        let store = fresh_store();
        let radius = store.value(&table_radius_key()).unwrap()[0];
        let slot_mean = store.value(&slot_mean_key()).unwrap();
        let plate_mean = store.value(&object_mean_key("plate")).unwrap();
        let fork_mean = store.value(&object_mean_key("left_fork")).unwrap();

        let table_pose = PlanarPose::new(0.5, 0.5, 0.0);
        let ps = table_pose
            .chain(&slot_anchor(radius, 0))
            .chain(&PlanarPose::from_slice(&slot_mean));
        let plate_pose = ps.chain(&PlanarPose::from_slice(&plate_mean));
        let fork_pose = ps.chain(&PlanarPose::from_slice(&fork_mean));

        let scene = SceneRecord::new(vec![
            SceneObject {
                class: "plate".into(),
                params: vec![0.2],
                params_names: vec!["radius".into()],
                pose: plate_pose.to_vec(),
                color: None,
                img_path: None,
            },
            SceneObject {
                class: "fork".into(),
                params: vec![0.02, 0.14],
                params_names: vec!["width".into(), "height".into()],
                pose: fork_pose.to_vec(),
                color: None,
                img_path: None,
            },
        ]);

        let assembler = TableSettingAssembler::default();
        let tree = assembler.assemble(&scene, &store).unwrap();
        assert_eq!(tree.terminals.len(), 2);

        let lp = tree.log_prob(&store).unwrap();
        assert!(lp.is_finite());
        // The fork offset was placed exactly at its mean, so the recovered
        // relative offset scores at the density peak; shifting the scene
        // must only lower the probability.
        let mut shifted = scene.clone();
        shifted.objects[1].pose[0] += 0.02;
        let shifted_tree = assembler.assemble(&shifted, &store).unwrap();
        assert!(shifted_tree.log_prob(&store).unwrap() < lp);
    }
}
