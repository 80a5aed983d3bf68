//! Damped Gauss-Newton solver for feasibility projections
//!
//! This is a Levenberg-Marquardt loop over a small, dense parameter block
//! (one object's pose) with a residual count that varies at runtime (one
//! block of residuals per constraint against each already-placed object).
//! Parameters and residuals are therefore dynamically sized.
//!
//! The solver never raises on non-convergence: projection consumers want the
//! best available iterate, and enforcement happens downstream via explicit
//! bounds checks on the final scene.

use nalgebra::{Cholesky, DMatrix, DVector};

/// Levenberg-Marquardt solver with dynamic residual count
///
/// # Example
/// ```ignore
/// let solver = ProjectionSolver::new().with_max_iterations(30);
/// let result = solver.solve(q0, |q| residuals_and_jacobian(q));
/// // result.params is the best iterate found, converged or not
/// ```
#[derive(Debug, Clone)]
pub struct ProjectionSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_scale_up: f64,
    pub lambda_scale_down: f64,
}

/// Result of a projection solve
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Best parameter iterate found
    pub params: DVector<f64>,
    /// Residual norm at `params`
    pub error: f64,
    /// Iterations actually run
    pub iterations: usize,
    /// Whether the step-norm convergence test fired
    pub converged: bool,
}

impl ProjectionSolver {
    pub fn new() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 50,
            initial_lambda: 1e-4,
            lambda_scale_up: 10.0,
            lambda_scale_down: 0.1,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_lambda_params(mut self, initial: f64, scale_up: f64, scale_down: f64) -> Self {
        self.initial_lambda = initial;
        self.lambda_scale_up = scale_up;
        self.lambda_scale_down = scale_down;
        self
    }

    /// Minimize the sum-of-squares of the residual vector
    ///
    /// # Arguments
    /// * `params` - Initial parameter guess
    /// * `cost_fn` - Computes the residual vector and its Jacobian
    ///   (rows = residuals, columns = parameters) at the given parameters
    ///
    /// # Returns
    /// The best iterate seen over the whole run, even when the loop bails
    /// out on divergence or hits the iteration cap.
    pub fn solve<F>(&self, params: DVector<f64>, mut cost_fn: F) -> SolveResult
    where
        F: FnMut(&DVector<f64>) -> (DVector<f64>, DMatrix<f64>),
    {
        let n_params = params.len();
        let mut params = params;
        let mut lambda = self.initial_lambda;

        let (residuals, _) = cost_fn(&params);
        let mut best_params = params.clone();
        let mut best_error = residuals.norm();

        let mut converged = false;
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            let (residuals, jacobian) = cost_fn(&params);
            let error = residuals.norm();

            // Gauss-Newton system: (J^T J + lambda * diag) delta = J^T r
            let mut jtj = jacobian.tr_mul(&jacobian);
            let jtr = jacobian.tr_mul(&residuals);
            let gradient_norm = jtr.norm();

            for i in 0..n_params {
                jtj[(i, i)] += lambda * jtj[(i, i)].max(1.0);
            }

            // Damped JtJ is symmetric positive definite for lambda > 0, but
            // a pathological Jacobian can still defeat the factorization.
            let step = match Cholesky::new(jtj) {
                Some(chol) => chol.solve(&jtr),
                None => {
                    lambda *= self.lambda_scale_up;
                    continue;
                }
            };

            let new_params = &params - &step;
            let (new_residuals, _) = cost_fn(&new_params);
            let new_error = new_residuals.norm();

            let step_norm = step.norm();

            if new_error < error {
                // Good step - accept and decrease damping
                params = new_params;
                lambda *= self.lambda_scale_down;

                if new_error < best_error {
                    best_error = new_error;
                    best_params = params.clone();
                }

                if step_norm < self.tolerance {
                    converged = true;
                    log::debug!(
                        "projection converged after {} iterations (error={:.3e})",
                        iteration + 1,
                        new_error
                    );
                    break;
                }
            } else {
                // Bad step - reject and increase damping
                lambda *= self.lambda_scale_up;

                // Local minimum: gradient already flat, stepping won't help
                if gradient_norm < 1e-9 {
                    converged = true;
                    break;
                }

                // Divergence symptom: damping grew without progress
                if !lambda.is_finite() || lambda > 1e12 {
                    log::debug!(
                        "projection lambda diverged at iteration {} (gradient={:.2e})",
                        iteration,
                        gradient_norm
                    );
                    break;
                }
            }
        }

        SolveResult {
            params: best_params,
            error: best_error,
            iterations,
            converged,
        }
    }
}

impl Default for ProjectionSolver {
    fn default() -> Self {
        Self::new()
    }
}
