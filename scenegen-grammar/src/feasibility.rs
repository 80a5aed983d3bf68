//! Feasibility projection: the differentiable-projection distribution
//!
//! Given a tentative pose for the next object and the scene built so far,
//! project the pose to the nearest feasibility-adjacent configuration (no
//! interpenetration beyond a tolerance, inside declared bounds) and expose
//! the local sensitivity of the projected output to the pre-projection
//! input. The forward value is the feasible point; the backward gradient is
//! the projection Jacobian rather than the identity, so the projection can
//! sit inside a gradient-based training loop as if it were a smooth
//! reparameterized sample.
//!
//! Bodies are approximated by bounding discs in the xz plane; the
//! constrained projection is solved as a penalty least-squares problem with
//! jet-exact Jacobians, and the output sensitivity comes from
//! implicit-function differentiation of the optimality conditions at the
//! solution (never finite differences).

use crate::dist::DiagonalNormal;
use crate::pose::PlanarPose;
use crate::scene::SceneRecord;
use nalgebra::{Cholesky, DMatrix, DVector};
use scenegen_solver::{Jet, ProjectionSolver};

/// Weight on constraint-violation penalty residuals relative to the unit
/// weight on staying near the pre-projection pose.
const PENALTY_WEIGHT: f64 = 100.0;

/// Fixed scale of the Normal wrapped around the projected point.
const PROJECTION_SCALE: f64 = 0.05;

/// Largest supported number of simultaneously free DOFs (one spatial body).
const MAX_FREE_DOFS: usize = 6;

type PJet = Jet<MAX_FREE_DOFS>;

/// Tagged constraint variants understood by the oracle
#[derive(Debug, Clone)]
pub enum ConstraintSpec {
    /// Minimum surface-to-surface separation between every body pair
    MinimumSeparationDistance(f64),
    /// Box bounds on a subset of configuration DOFs. Pinning a DOF is
    /// expressed as min == max.
    BoundingBox {
        min: Vec<f64>,
        max: Vec<f64>,
        applies_to: Vec<usize>,
    },
}

/// A body participating in a projection: bounding disc radius plus its
/// slice of the configuration vector
#[derive(Debug, Clone)]
pub struct ProjectionBody {
    pub class: String,
    pub radius: f64,
    pub pose: PlanarPose,
}

/// Physics feasibility oracle interface
///
/// `initial` is the stacked configuration of every body (3 DOFs per body:
/// x, z, theta). Returns the projected configuration and the sensitivity
/// d(final)/d(initial) evaluated at the solution.
pub trait FeasibilityOracle {
    fn project_to_feasibility(
        &self,
        initial: &DVector<f64>,
        constraints: &[ConstraintSpec],
    ) -> (DVector<f64>, DMatrix<f64>);
}

/// Oracle over bounding discs in the xz plane
pub struct DiscSceneOracle {
    radii: Vec<f64>,
    solver: ProjectionSolver,
}

const DOFS_PER_BODY: usize = 3;

impl DiscSceneOracle {
    pub fn new(radii: Vec<f64>) -> Self {
        Self {
            radii,
            solver: ProjectionSolver::new()
                .with_max_iterations(60)
                .with_tolerance(1e-10),
        }
    }

    /// DOFs left free by the bounding boxes (everything is free by default;
    /// a box with min == max pins a DOF)
    fn free_dofs(&self, initial: &DVector<f64>, constraints: &[ConstraintSpec]) -> Vec<usize> {
        let mut free = vec![true; initial.len()];
        for constraint in constraints {
            if let ConstraintSpec::BoundingBox { min, max, applies_to } = constraint {
                for (k, &dof) in applies_to.iter().enumerate() {
                    if min[k] >= max[k] {
                        free[dof] = false;
                    }
                }
            }
        }
        (0..initial.len()).filter(|&i| free[i]).collect()
    }

    /// Residual vector and Jacobian over the free DOFs at `q_free`
    fn residuals(
        &self,
        q_free: &DVector<f64>,
        q0_full: &DVector<f64>,
        q0_free: &[f64],
        free: &[usize],
        constraints: &[ConstraintSpec],
    ) -> (DVector<f64>, DMatrix<f64>) {
        let n_free = free.len();

        // Full configuration with jets substituted on the free DOFs
        let q_jets: Vec<PJet> = (0..q0_full.len())
            .map(|dof| match free.iter().position(|&f| f == dof) {
                Some(local) => PJet::variable(q_free[local], local),
                None => PJet::constant(q0_full[dof]),
            })
            .collect();

        let mut rows: Vec<PJet> = Vec::new();

        // Stay near the pre-projection configuration
        for (local, _) in free.iter().enumerate() {
            rows.push(PJet::variable(q_free[local], local) - PJet::constant(q0_free[local]));
        }

        for constraint in constraints {
            match constraint {
                ConstraintSpec::MinimumSeparationDistance(min_distance) => {
                    let n_bodies = self.radii.len();
                    for a in 0..n_bodies {
                        for b in (a + 1)..n_bodies {
                            // Pairs with no free DOF are constant; skip them
                            let a_base = a * DOFS_PER_BODY;
                            let b_base = b * DOFS_PER_BODY;
                            let movable = free
                                .iter()
                                .any(|&f| (f >= a_base && f < a_base + 2) || (f >= b_base && f < b_base + 2));
                            if !movable {
                                continue;
                            }
                            let dx = q_jets[a_base] - q_jets[b_base];
                            let dz = q_jets[a_base + 1] - q_jets[b_base + 1];
                            // Small epsilon keeps sqrt differentiable at
                            // exactly coincident centers
                            let dist = (dx * dx + dz * dz + PJet::constant(1e-12)).sqrt();
                            let violation = PJet::constant(
                                self.radii[a] + self.radii[b] + min_distance,
                            ) - dist;
                            rows.push(violation.hinge() * PJet::constant(PENALTY_WEIGHT));
                        }
                    }
                }
                ConstraintSpec::BoundingBox { min, max, applies_to } => {
                    for (k, &dof) in applies_to.iter().enumerate() {
                        if min[k] >= max[k] {
                            continue; // pinned, handled by the free-DOF set
                        }
                        let q = q_jets[dof];
                        if min[k].is_finite() {
                            let low = (PJet::constant(min[k]) - q).hinge();
                            rows.push(low * PJet::constant(PENALTY_WEIGHT));
                        }
                        if max[k].is_finite() {
                            let high = (q - PJet::constant(max[k])).hinge();
                            rows.push(high * PJet::constant(PENALTY_WEIGHT));
                        }
                    }
                }
            }
        }

        let mut residuals = DVector::zeros(rows.len());
        let mut jacobian = DMatrix::zeros(rows.len(), n_free);
        for (i, row) in rows.iter().enumerate() {
            residuals[i] = row.value;
            for j in 0..n_free {
                jacobian[(i, j)] = row.derivs[j];
            }
        }
        (residuals, jacobian)
    }
}

impl FeasibilityOracle for DiscSceneOracle {
    fn project_to_feasibility(
        &self,
        initial: &DVector<f64>,
        constraints: &[ConstraintSpec],
    ) -> (DVector<f64>, DMatrix<f64>) {
        let n = initial.len();
        assert_eq!(n, self.radii.len() * DOFS_PER_BODY);

        let free = self.free_dofs(initial, constraints);
        let identity = DMatrix::identity(n, n);
        if free.is_empty() {
            return (initial.clone(), identity);
        }
        if free.len() > MAX_FREE_DOFS {
            // One object is projected at a time; more free DOFs than one
            // body should not happen. Fall back to the unprojected input,
            // which downstream bounds checks will filter.
            log::warn!(
                "projection with {} free DOFs exceeds the supported {}; skipping",
                free.len(),
                MAX_FREE_DOFS
            );
            return (initial.clone(), identity);
        }

        let q0_free: Vec<f64> = free.iter().map(|&f| initial[f]).collect();
        let result = self.solver.solve(
            DVector::from_column_slice(&q0_free),
            |q_free| self.residuals(q_free, initial, &q0_free, &free, constraints),
        );

        // Assemble the full projected configuration: pinned DOFs unchanged
        let mut q_final = initial.clone();
        for (local, &dof) in free.iter().enumerate() {
            q_final[dof] = result.params[local];
        }

        // Implicit-function sensitivity at the solution. The optimality
        // condition is J^T r(q, q0) = 0 with the anchor block r = q - q0,
        // so d qf / d q0 = (J^T J)^-1 on the free block (Gauss-Newton
        // approximation of the penalty Hessian), identity on pinned DOFs.
        let (_, jacobian) = self.residuals(&result.params, initial, &q0_free, &free, constraints);
        let jtj = jacobian.tr_mul(&jacobian);
        let block = match Cholesky::new(jtj.clone()) {
            Some(chol) => chol.inverse(),
            None => DMatrix::identity(free.len(), free.len()),
        };

        let mut sensitivity = identity;
        for (il, &i) in free.iter().enumerate() {
            for (jl, &j) in free.iter().enumerate() {
                sensitivity[(i, j)] = block[(il, jl)];
            }
        }

        (q_final, sensitivity)
    }
}

/// The projected pose treated as a distribution
///
/// A sample is the feasible point itself; densities are evaluated under a
/// Normal centered there with small fixed variance. The gradient exposed to
/// consumers chains through the projection sensitivity instead of the
/// identity (straight-through with exact projection gradient).
#[derive(Debug, Clone)]
pub struct ProjectToFeasibilityDist {
    center: Vec<f64>,
    /// d(center) / d(pre-projection input)
    sensitivity: DMatrix<f64>,
    /// False when the projection was short-circuited; the value is then
    /// semantically meaningless and must be masked out by the caller.
    pub projected: bool,
}

impl ProjectToFeasibilityDist {
    pub fn new(center: Vec<f64>, sensitivity: DMatrix<f64>, projected: bool) -> Self {
        Self {
            center,
            sensitivity,
            projected,
        }
    }

    /// The reparameterized sample: always the projected (or passed-through)
    /// point
    pub fn rsample(&self) -> &[f64] {
        &self.center
    }

    pub fn sensitivity(&self) -> &DMatrix<f64> {
        &self.sensitivity
    }

    fn normal(&self) -> DiagonalNormal {
        DiagonalNormal::new(self.center.clone(), vec![PROJECTION_SCALE; self.center.len()])
    }

    pub fn log_prob(&self, value: &[f64]) -> f64 {
        self.normal().log_prob(value)
    }

    /// d log_prob(value) / d(pre-projection input): the gradient w.r.t. the
    /// distribution center, chained through the projection sensitivity
    pub fn log_prob_grad_wrt_input(&self, value: &[f64]) -> Vec<f64> {
        let scale_sq = PROJECTION_SCALE * PROJECTION_SCALE;
        // d log_prob / d center_i = (value_i - center_i) / scale^2
        let d_center: Vec<f64> = value
            .iter()
            .zip(&self.center)
            .map(|(&v, &c)| (v - c) / scale_sq)
            .collect();
        let n = self.center.len();
        (0..n)
            .map(|j| (0..n).map(|i| d_center[i] * self.sensitivity[(i, j)]).sum())
            .collect()
    }
}

/// Project one candidate object against the scene built so far.
///
/// Short-circuit policy: if the candidate's class does not match the class
/// being scored at this slot, or an earlier slot already stopped
/// (`keep_going` false), skip the solve and return the unprojected input.
/// The returned value is masked out of the objective by the caller, so only
/// speed matters on that path.
#[allow(clippy::too_many_arguments)]
pub fn project_candidate(
    pre_projection: &PlanarPose,
    candidate_class: &str,
    candidate_radius: f64,
    slot_class: &str,
    keep_going: bool,
    placed: &[ProjectionBody],
    min_separation: f64,
    translation_bounds: Option<([f64; 2], [f64; 2])>,
) -> ProjectToFeasibilityDist {
    let dof = DOFS_PER_BODY;
    if candidate_class != slot_class || !keep_going {
        return ProjectToFeasibilityDist::new(
            pre_projection.to_vec(),
            DMatrix::identity(dof, dof),
            false,
        );
    }

    // Exactly coincident centers give the separation penalty no descent
    // direction; break the tie with a tiny deterministic nudge.
    let mut candidate_pose = *pre_projection;
    for body in placed {
        if (candidate_pose.x - body.pose.x).abs() < 1e-9
            && (candidate_pose.z - body.pose.z).abs() < 1e-9
        {
            candidate_pose.x += 1e-6;
        }
    }

    // Stacked configuration: placed bodies first, candidate last
    let n_bodies = placed.len() + 1;
    let mut q0 = DVector::zeros(n_bodies * dof);
    let mut radii = Vec::with_capacity(n_bodies);
    for (k, body) in placed.iter().enumerate() {
        q0[k * dof] = body.pose.x;
        q0[k * dof + 1] = body.pose.z;
        q0[k * dof + 2] = body.pose.theta;
        radii.push(body.radius);
    }
    let candidate_base = placed.len() * dof;
    q0[candidate_base] = candidate_pose.x;
    q0[candidate_base + 1] = candidate_pose.z;
    q0[candidate_base + 2] = candidate_pose.theta;
    radii.push(candidate_radius);

    // Pin every placed body's DOFs; free the candidate's
    let mut box_min = Vec::with_capacity(n_bodies * dof);
    let mut box_max = Vec::with_capacity(n_bodies * dof);
    for dof_index in 0..n_bodies * dof {
        if dof_index < candidate_base {
            box_min.push(q0[dof_index]);
            box_max.push(q0[dof_index]);
        } else {
            box_min.push(f64::NEG_INFINITY);
            box_max.push(f64::INFINITY);
        }
    }
    if let Some((xb, zb)) = translation_bounds {
        box_min[candidate_base] = xb[0];
        box_max[candidate_base] = xb[1];
        box_min[candidate_base + 1] = zb[0];
        box_max[candidate_base + 1] = zb[1];
    }

    let constraints = vec![
        ConstraintSpec::MinimumSeparationDistance(min_separation),
        ConstraintSpec::BoundingBox {
            min: box_min,
            max: box_max,
            applies_to: (0..n_bodies * dof).collect(),
        },
    ];

    let oracle = DiscSceneOracle::new(radii);
    let (q_final, sensitivity) = oracle.project_to_feasibility(&q0, &constraints);

    let center = vec![
        q_final[candidate_base],
        q_final[candidate_base + 1],
        q_final[candidate_base + 2],
    ];
    let mut block = DMatrix::identity(dof, dof);
    for i in 0..dof {
        for j in 0..dof {
            block[(i, j)] = sensitivity[(candidate_base + i, candidate_base + j)];
        }
    }
    ProjectToFeasibilityDist::new(center, block, true)
}

/// Post-hoc acceptance check on a generated planar scene
///
/// The projection itself may return a best-effort iterate; this explicit
/// bounds check on the final scene is the enforcement point. Rejected
/// scenes are counted by callers and never written out.
#[derive(Debug, Clone)]
pub struct SceneBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl Default for SceneBounds {
    fn default() -> Self {
        Self {
            x_min: -2.0,
            x_max: 2.0,
            z_min: 0.0,
            z_max: 2.0,
        }
    }
}

impl SceneBounds {
    pub fn accepts(&self, record: &SceneRecord) -> bool {
        record.objects.iter().all(|obj| {
            if !obj.is_planar() {
                return true;
            }
            let (x, z) = (obj.pose[0], obj.pose[1]);
            x >= self.x_min && x <= self.x_max && z >= self.z_min && z <= self.z_max
        })
    }
}
