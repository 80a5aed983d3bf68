//! Learned-parameter store
//!
//! Parameters are identified by structured (component, slot, field) keys and
//! live in an explicit store object that is passed by reference into node
//! and rule constructors and into the fitting loop. Lookup of an
//! unregistered key fails loudly instead of silently creating a
//! zero-initialized parameter.
//!
//! Values are stored in unconstrained space and transformed on read
//! (exp / softmax / sigmoid), so a first-order optimizer stepping the
//! unconstrained values can never violate a constraint. Gradients computed
//! against the constrained values are chained through the transform
//! Jacobian before being applied.

use crate::error::GrammarError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

/// Floor applied when inverting transforms so zero-probability entries map
/// to a large negative unconstrained value instead of -inf.
const VALUE_FLOOR: f64 = 1e-12;

/// Structured parameter identity: (component, slot, field)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub component: String,
    pub slot: String,
    pub field: String,
}

impl ParamKey {
    pub fn new(
        component: impl Into<String>,
        slot: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            slot: slot.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.component, self.slot, self.field)
    }
}

/// Constraint kind of a stored parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Unconstrained,
    /// Componentwise positive (read as exp of storage)
    Positive,
    /// Non-negative, sums to one (read as softmax of storage)
    Simplex,
    /// Componentwise in [0, 1] (read as sigmoid of storage)
    UnitInterval,
}

#[derive(Debug, Clone)]
struct Param {
    unconstrained: Vec<f64>,
    constraint: ConstraintKind,
}

fn sigmoid(u: f64) -> f64 {
    1.0 / (1.0 + (-u).exp())
}

impl Param {
    fn from_constrained(value: &[f64], constraint: ConstraintKind) -> Self {
        let unconstrained = match constraint {
            ConstraintKind::Unconstrained => value.to_vec(),
            ConstraintKind::Positive | ConstraintKind::Simplex => {
                value.iter().map(|&v| v.max(VALUE_FLOOR).ln()).collect()
            }
            ConstraintKind::UnitInterval => value
                .iter()
                .map(|&v| {
                    let v = v.clamp(VALUE_FLOOR, 1.0 - VALUE_FLOOR);
                    (v / (1.0 - v)).ln()
                })
                .collect(),
        };
        Self {
            unconstrained,
            constraint,
        }
    }

    fn constrained(&self) -> Vec<f64> {
        match self.constraint {
            ConstraintKind::Unconstrained => self.unconstrained.clone(),
            ConstraintKind::Positive => self.unconstrained.iter().map(|&u| u.exp()).collect(),
            ConstraintKind::UnitInterval => self.unconstrained.iter().map(|&u| sigmoid(u)).collect(),
            ConstraintKind::Simplex => {
                // Shift by the max for numerical stability
                let max = self
                    .unconstrained
                    .iter()
                    .cloned()
                    .fold(f64::NEG_INFINITY, f64::max);
                let exps: Vec<f64> = self.unconstrained.iter().map(|&u| (u - max).exp()).collect();
                let total: f64 = exps.iter().sum();
                exps.into_iter().map(|e| e / total).collect()
            }
        }
    }

    /// Chain a gradient w.r.t. the constrained value back to unconstrained space
    fn chain_gradient(&self, grad_constrained: &[f64]) -> Vec<f64> {
        let value = self.constrained();
        match self.constraint {
            ConstraintKind::Unconstrained => grad_constrained.to_vec(),
            ConstraintKind::Positive => grad_constrained
                .iter()
                .zip(&value)
                .map(|(&g, &v)| g * v)
                .collect(),
            ConstraintKind::UnitInterval => grad_constrained
                .iter()
                .zip(&value)
                .map(|(&g, &v)| g * v * (1.0 - v))
                .collect(),
            ConstraintKind::Simplex => {
                // Full softmax Jacobian: du_i = v_i * (g_i - sum_j g_j v_j)
                let inner: f64 = grad_constrained
                    .iter()
                    .zip(&value)
                    .map(|(&g, &v)| g * v)
                    .sum();
                value
                    .iter()
                    .zip(grad_constrained)
                    .map(|(&v, &g)| v * (g - inner))
                    .collect()
            }
        }
    }
}

/// Sparse gradient accumulator keyed by parameter
///
/// Gradients are accumulated in constrained space (the space the
/// log-probability formulas are written in); the store chains them to
/// unconstrained space when an optimizer step is applied.
#[derive(Debug, Clone, Default)]
pub struct GradientMap {
    grads: HashMap<ParamKey, Vec<f64>>,
}

impl GradientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, key: &ParamKey, grad: &[f64]) {
        let entry = self
            .grads
            .entry(key.clone())
            .or_insert_with(|| vec![0.0; grad.len()]);
        for (e, &g) in entry.iter_mut().zip(grad) {
            *e += g;
        }
    }

    pub fn merge(&mut self, other: &GradientMap) {
        for (key, grad) in &other.grads {
            self.accumulate(key, grad);
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for grad in self.grads.values_mut() {
            for g in grad.iter_mut() {
                *g *= factor;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.grads.keys()
    }

    pub fn get(&self, key: &ParamKey) -> Option<&[f64]> {
        self.grads.get(key).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &[f64])> {
        self.grads.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

/// Process-wide named parameter storage
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: HashMap<ParamKey, Param>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with a constrained-space initial value.
    ///
    /// Registration is idempotent: if the key already exists the stored
    /// value is kept, so learned values persist across repeated grammar
    /// construction.
    pub fn register(&mut self, key: ParamKey, init: &[f64], constraint: ConstraintKind) -> ParamKey {
        self.params
            .entry(key.clone())
            .or_insert_with(|| Param::from_constrained(init, constraint));
        key
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.params.contains_key(key)
    }

    /// Constrained-space value of a parameter; unknown keys are an error
    pub fn value(&self, key: &ParamKey) -> Result<Vec<f64>, GrammarError> {
        self.params
            .get(key)
            .map(|p| p.constrained())
            .ok_or_else(|| GrammarError::UnknownParam(key.clone()))
    }

    /// Like [`value`](Self::value) but also checks the expected length
    pub fn value_checked(&self, key: &ParamKey, expected: usize) -> Result<Vec<f64>, GrammarError> {
        let v = self.value(key)?;
        if v.len() != expected {
            return Err(GrammarError::ParamShapeMismatch {
                key: key.clone(),
                actual: v.len(),
                expected,
            });
        }
        Ok(v)
    }

    /// Chain a constrained-space gradient to unconstrained space
    pub fn chain_gradient(
        &self,
        key: &ParamKey,
        grad_constrained: &[f64],
    ) -> Result<Vec<f64>, GrammarError> {
        self.params
            .get(key)
            .map(|p| p.chain_gradient(grad_constrained))
            .ok_or_else(|| GrammarError::UnknownParam(key.clone()))
    }

    /// Apply an additive step to the unconstrained storage of a parameter
    pub fn apply_step(&mut self, key: &ParamKey, step: &[f64]) -> Result<(), GrammarError> {
        let param = self
            .params
            .get_mut(key)
            .ok_or_else(|| GrammarError::UnknownParam(key.clone()))?;
        for (u, &s) in param.unconstrained.iter_mut().zip(step) {
            *u += s;
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.params.keys()
    }

    /// Name -> constrained value snapshot, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, Vec<f64>> {
        self.params
            .iter()
            .map(|(k, p)| (k.to_string(), p.constrained()))
            .collect()
    }

    /// Checkpoint the constrained values to a YAML snapshot on disk
    pub fn save(&self, path: &Path) -> Result<(), crate::error::SceneError> {
        let yaml = serde_yaml::to_string(&self.snapshot())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Restore constrained values from a snapshot.
    ///
    /// Every snapshot entry must name an already-registered parameter;
    /// a typo'd or stale name is a loud error.
    pub fn load(&mut self, path: &Path) -> Result<(), crate::error::SceneError> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: BTreeMap<String, Vec<f64>> = serde_yaml::from_str(&text)?;
        for (name, value) in snapshot {
            let mut parts = name.splitn(3, '/');
            let key = match (parts.next(), parts.next(), parts.next()) {
                (Some(c), Some(s), Some(f)) => ParamKey::new(c, s, f),
                _ => return Err(crate::error::SceneError::MissingField("parameter name")),
            };
            let constraint = self
                .params
                .get(&key)
                .map(|p| p.constraint)
                .ok_or_else(|| crate::error::SceneError::UnknownParameter(key.to_string()))?;
            self.params
                .insert(key, Param::from_constrained(&value, constraint));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn key(field: &str) -> ParamKey {
        ParamKey::new("test", "slot", field)
    }

    #[test]
    fn test_unknown_key_fails_loudly() {
        let store = ParamStore::new();
        assert!(matches!(
            store.value(&key("nope")),
            Err(GrammarError::UnknownParam(_))
        ));
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut store = ParamStore::new();
        let k = store.register(key("mean"), &[1.0, 2.0], ConstraintKind::Unconstrained);
        store.register(key("mean"), &[9.0, 9.0], ConstraintKind::Unconstrained);
        assert_eq!(store.value(&k).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_positive_roundtrip() {
        let mut store = ParamStore::new();
        let k = store.register(key("scale"), &[0.5, 3.0], ConstraintKind::Positive);
        let v = store.value(&k).unwrap();
        assert_abs_diff_eq!(v[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_simplex_roundtrip_and_normalization() {
        let mut store = ParamStore::new();
        let k = store.register(key("weights"), &[0.2, 0.3, 0.5], ConstraintKind::Simplex);
        let v = store.value(&k).unwrap();
        assert_abs_diff_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[0], 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(v[2], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_simplex_stays_normalized_after_step() {
        let mut store = ParamStore::new();
        let k = store.register(key("weights"), &[0.25; 4], ConstraintKind::Simplex);
        store.apply_step(&k, &[0.3, -0.2, 1.0, 0.0]).unwrap();
        let v = store.value(&k).unwrap();
        assert_abs_diff_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(v.iter().all(|&p| p > 0.0));
    }

    #[test]
    fn test_positive_gradient_chain() {
        // v = exp(u), so dL/du = dL/dv * v
        let mut store = ParamStore::new();
        let k = store.register(key("scale"), &[2.0], ConstraintKind::Positive);
        let g = store.chain_gradient(&k, &[0.5]).unwrap();
        assert_abs_diff_eq!(g[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_simplex_gradient_chain_matches_finite_difference() {
        let mut store = ParamStore::new();
        let k = store.register(key("weights"), &[0.2, 0.5, 0.3], ConstraintKind::Simplex);

        // Objective: L(v) = 2*v0 - v2; analytic dL/dv = [2, 0, -1]
        let grad_u = store.chain_gradient(&k, &[2.0, 0.0, -1.0]).unwrap();

        let eval = |store: &ParamStore| {
            let v = store.value(&k).unwrap();
            2.0 * v[0] - v[2]
        };
        let base = eval(&store);
        let eps = 1e-7;
        for i in 0..3 {
            let mut shifted = store.clone();
            let mut step = [0.0; 3];
            step[i] = eps;
            shifted.apply_step(&k, &step).unwrap();
            let fd = (eval(&shifted) - base) / eps;
            assert_abs_diff_eq!(grad_u[i], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_gradient_map_accumulate_and_merge() {
        let mut a = GradientMap::new();
        a.accumulate(&key("mean"), &[1.0, 2.0]);
        a.accumulate(&key("mean"), &[0.5, -1.0]);

        let mut b = GradientMap::new();
        b.accumulate(&key("mean"), &[1.0, 1.0]);
        b.merge(&a);

        assert_eq!(b.get(&key("mean")).unwrap(), &[2.5, 2.0]);
    }

    #[test]
    fn test_snapshot_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");

        let mut store = ParamStore::new();
        store.register(key("mean"), &[0.1, -0.4], ConstraintKind::Unconstrained);
        store.register(key("scale"), &[0.7], ConstraintKind::Positive);
        store.save(&path).unwrap();

        let mut restored = ParamStore::new();
        restored.register(key("mean"), &[0.0, 0.0], ConstraintKind::Unconstrained);
        restored.register(key("scale"), &[1.0], ConstraintKind::Positive);
        restored.load(&path).unwrap();

        assert_abs_diff_eq!(restored.value(&key("mean")).unwrap()[1], -0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(restored.value(&key("scale")).unwrap()[0], 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_load_unknown_name_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");

        let mut store = ParamStore::new();
        store.register(key("mean"), &[0.0], ConstraintKind::Unconstrained);
        store.save(&path).unwrap();

        let mut other = ParamStore::new();
        assert!(other.load(&path).is_err());
    }
}
