//! scenegen-solver: Forward-mode automatic differentiation and projection solves
//!
//! This crate provides forward-mode automatic differentiation using const
//! generics, generic small-vector math that works with or without autodiff,
//! and a damped Gauss-Newton solver used to project candidate object poses
//! to physical feasibility.

mod jet;
pub mod math3d;
pub mod solver;

pub use jet::{Jet, Real};
pub use solver::{ProjectionSolver, SolveResult};

// Re-export nalgebra for convenience
pub use nalgebra;
