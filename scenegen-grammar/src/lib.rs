//! scenegen-grammar: probabilistic scene grammars with feasibility projection
//!
//! This crate generates synthetic physical scenes by recursively expanding
//! probabilistic grammars over typed nodes (Or / And / CovaryingSet /
//! IndependentSet / Terminal), optionally projecting candidate object poses
//! to physical feasibility through a differentiable nonlinear projection,
//! and fitting the grammars' learned parameters to observed scene datasets
//! by direct gradient ascent on the joint log-probability.

pub mod dist;
pub mod error;
pub mod feasibility;
pub mod fitting;
pub mod grammars;
pub mod nodes;
pub mod params;
pub mod pose;
pub mod rules;
pub mod scene;
pub mod tree;

pub use error::{FitError, GrammarError, SceneError};
pub use feasibility::{
    project_candidate, ConstraintSpec, DiscSceneOracle, FeasibilityOracle, ProjectionBody,
    ProjectToFeasibilityDist, SceneBounds,
};
pub use fitting::{fit, evaluate, Adam, FitConfig, SceneAssembler};
pub use nodes::{Node, SelectionStrategy, TerminalPayload};
pub use params::{ConstraintKind, GradientMap, ParamKey, ParamStore};
pub use pose::{PlanarPose, Pose, SpatialPose};
pub use rules::{ChildFactory, OffsetRule, ProductionRule};
pub use scene::{append_scene, load_scenes, save_scenes, SceneObject, SceneRecord};
pub use tree::{ExpansionConfig, ObservedResolver, ParseTree};
