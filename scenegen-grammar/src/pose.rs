//! Rigid transform algebra for planar and spatial poses
//!
//! Planar poses are (x, z, theta); spatial poses are xyz translation plus
//! roll/pitch/yaw. Chaining composes a child pose expressed in the parent
//! frame onto the parent's world pose; `invert` is the exact algebraic
//! inverse of chaining, which the production rules rely on to recover
//! relative offsets from observed absolute poses.

use scenegen_solver::math3d::{mat3_from_rpy, Mat3, Vec2, Vec3};

/// Planar rigid transform: translation in the xz plane plus a heading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarPose {
    pub x: f64,
    pub z: f64,
    pub theta: f64,
}

impl PlanarPose {
    pub const fn new(x: f64, z: f64, theta: f64) -> Self {
        Self { x, z, theta }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Compose a child pose (in this pose's frame) into the world frame
    ///
    /// Rotations add; the child translation is rotated by this pose's
    /// heading before translating.
    pub fn chain(&self, child: &PlanarPose) -> PlanarPose {
        let rotated = Vec2::new(child.x, child.z).rotate(self.theta);
        PlanarPose {
            x: self.x + rotated.x,
            z: self.z + rotated.y,
            theta: self.theta + child.theta,
        }
    }

    /// Exact inverse: `p.invert().chain(&p.chain(&q)) == q`
    pub fn invert(&self) -> PlanarPose {
        let unrotated = Vec2::new(self.x, self.z).rotate(-self.theta);
        PlanarPose {
            x: -unrotated.x,
            z: -unrotated.y,
            theta: -self.theta,
        }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.x, self.z, self.theta]
    }

    pub fn from_slice(v: &[f64]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Spatial rigid transform: xyz translation plus roll/pitch/yaw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialPose {
    pub translation: Vec3<f64>,
    pub rpy: Vec3<f64>,
}

impl SpatialPose {
    pub const fn new(translation: Vec3<f64>, rpy: Vec3<f64>) -> Self {
        Self { translation, rpy }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 0.0))
    }

    pub fn rotation(&self) -> Mat3<f64> {
        mat3_from_rpy(self.rpy.x, self.rpy.y, self.rpy.z)
    }

    /// Recover roll/pitch/yaw from a rotation matrix
    ///
    /// Near pitch = ±pi/2 the x and z rotations become degenerate
    /// (gimbal lock); the singular branch pins yaw to zero and folds the
    /// remaining rotation into roll, so the recovered pose still rebuilds
    /// the same matrix.
    fn rpy_from_rotation(rot: &Mat3<f64>) -> Vec3<f64> {
        let sy = (rot.m00() * rot.m00() + rot.m10() * rot.m10()).sqrt();
        if sy >= 1e-6 {
            Vec3::new(
                rot.m21().atan2(rot.m22()),
                (-rot.m20()).atan2(sy),
                rot.m10().atan2(rot.m00()),
            )
        } else {
            // Singular branch
            Vec3::new(
                (-rot.m12()).atan2(rot.m11()),
                (-rot.m20()).atan2(sy),
                0.0,
            )
        }
    }

    /// Compose a child pose (in this pose's frame) into the world frame
    /// via full homogeneous-transform composition.
    pub fn chain(&self, child: &SpatialPose) -> SpatialPose {
        let r_parent = self.rotation();
        let r_child = child.rotation();
        let rotation = r_parent * r_child;
        let translation = self.translation + r_parent.mul_vec(child.translation);
        SpatialPose {
            translation,
            rpy: Self::rpy_from_rotation(&rotation),
        }
    }

    /// Exact inverse: R <- R^T, t <- -R^T t
    pub fn invert(&self) -> SpatialPose {
        let r_inv = self.rotation().transpose();
        SpatialPose {
            translation: -r_inv.mul_vec(self.translation),
            rpy: Self::rpy_from_rotation(&r_inv),
        }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.rpy.x,
            self.rpy.y,
            self.rpy.z,
        ]
    }

    pub fn from_slice(v: &[f64]) -> Self {
        Self::new(Vec3::new(v[0], v[1], v[2]), Vec3::new(v[3], v[4], v[5]))
    }

    /// Serialize as [qw, qx, qy, qz, x, y, z], the on-disk spatial pose form
    pub fn to_quaternion_pose(&self) -> [f64; 7] {
        let (sr, cr) = (0.5 * self.rpy.x).sin_cos();
        let (sp, cp) = (0.5 * self.rpy.y).sin_cos();
        let (sy, cy) = (0.5 * self.rpy.z).sin_cos();
        [
            cr * cp * cy + sr * sp * sy,
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Inverse of [`to_quaternion_pose`](Self::to_quaternion_pose)
    pub fn from_quaternion_pose(q: &[f64]) -> Self {
        let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
        // Build the rotation matrix from the quaternion, then reuse the
        // rpy recovery (including its singular branch).
        let rot = Mat3::from_cols(
            Vec3::new(
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y + w * z),
                2.0 * (x * z - w * y),
            ),
            Vec3::new(
                2.0 * (x * y - w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z + w * x),
            ),
            Vec3::new(
                2.0 * (x * z + w * y),
                2.0 * (y * z - w * x),
                1.0 - 2.0 * (x * x + y * y),
            ),
        );
        SpatialPose {
            translation: Vec3::new(q[4], q[5], q[6]),
            rpy: Self::rpy_from_rotation(&rot),
        }
    }
}

/// A pose of either scene family
///
/// Every node instance owns exactly one pose, fixed at construction.
/// Chaining across families is a programming error and panics loudly
/// rather than being silently accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pose {
    Planar(PlanarPose),
    Spatial(SpatialPose),
}

impl Pose {
    pub fn planar(x: f64, z: f64, theta: f64) -> Self {
        Pose::Planar(PlanarPose::new(x, z, theta))
    }

    pub fn spatial(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Pose::Spatial(SpatialPose::new(
            Vec3::new(x, y, z),
            Vec3::new(roll, pitch, yaw),
        ))
    }

    pub fn chain(&self, child: &Pose) -> Pose {
        match (self, child) {
            (Pose::Planar(p), Pose::Planar(c)) => Pose::Planar(p.chain(c)),
            (Pose::Spatial(p), Pose::Spatial(c)) => Pose::Spatial(p.chain(c)),
            _ => panic!("cannot chain poses of different scene families"),
        }
    }

    pub fn invert(&self) -> Pose {
        match self {
            Pose::Planar(p) => Pose::Planar(p.invert()),
            Pose::Spatial(p) => Pose::Spatial(p.invert()),
        }
    }

    /// Coordinate vector: 3 entries planar, 6 entries spatial
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            Pose::Planar(p) => p.to_vec(),
            Pose::Spatial(p) => p.to_vec(),
        }
    }

    /// Rebuild a pose of the same family as `self` from a coordinate vector
    pub fn with_coords(&self, v: &[f64]) -> Pose {
        match self {
            Pose::Planar(_) => Pose::Planar(PlanarPose::from_slice(v)),
            Pose::Spatial(_) => Pose::Spatial(SpatialPose::from_slice(v)),
        }
    }

    pub fn dof(&self) -> usize {
        match self {
            Pose::Planar(_) => 3,
            Pose::Spatial(_) => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_planar_eq(a: &PlanarPose, b: &PlanarPose, eps: f64) {
        assert_abs_diff_eq!(a.x, b.x, epsilon = eps);
        assert_abs_diff_eq!(a.z, b.z, epsilon = eps);
        assert_abs_diff_eq!(a.theta, b.theta, epsilon = eps);
    }

    fn assert_rotation_eq(a: &Mat3<f64>, b: &Mat3<f64>, eps: f64) {
        assert_abs_diff_eq!(a.m00(), b.m00(), epsilon = eps);
        assert_abs_diff_eq!(a.m10(), b.m10(), epsilon = eps);
        assert_abs_diff_eq!(a.m20(), b.m20(), epsilon = eps);
        assert_abs_diff_eq!(a.m01(), b.m01(), epsilon = eps);
        assert_abs_diff_eq!(a.m11(), b.m11(), epsilon = eps);
        assert_abs_diff_eq!(a.m21(), b.m21(), epsilon = eps);
        assert_abs_diff_eq!(a.m02(), b.m02(), epsilon = eps);
        assert_abs_diff_eq!(a.m12(), b.m12(), epsilon = eps);
        assert_abs_diff_eq!(a.m22(), b.m22(), epsilon = eps);
    }

    #[test]
    fn test_planar_chain_inverse_law() {
        // chain(invert(p), chain(p, q)) == q
        let cases = [
            (PlanarPose::new(0.5, 0.5, 0.0), PlanarPose::new(0.1, -0.2, 0.3)),
            (PlanarPose::new(-1.0, 2.0, 1.7), PlanarPose::new(0.0, 0.0, 0.0)),
            (PlanarPose::new(0.3, -0.4, -2.9), PlanarPose::new(-0.6, 0.2, PI)),
        ];
        for (p, q) in cases {
            let recovered = p.invert().chain(&p.chain(&q));
            assert_planar_eq(&recovered, &q, 1e-12);
        }
    }

    #[test]
    fn test_planar_invert_is_self_inverse() {
        let p = PlanarPose::new(0.7, -0.1, 0.9);
        let id = p.chain(&p.invert());
        assert_planar_eq(&id, &PlanarPose::identity(), 1e-12);
    }

    #[test]
    fn test_planar_composition_not_commutative() {
        let p = PlanarPose::new(1.0, 0.0, FRAC_PI_2);
        let q = PlanarPose::new(0.0, 1.0, 0.0);
        let pq = p.chain(&q);
        let qp = q.chain(&p);
        assert!((pq.x - qp.x).abs() > 1e-6 || (pq.z - qp.z).abs() > 1e-6);
    }

    #[test]
    fn test_spatial_chain_inverse_law() {
        let cases = [
            (
                SpatialPose::new(Vec3::new(0.1, 0.2, 0.3), Vec3::new(0.3, -0.4, 1.2)),
                SpatialPose::new(Vec3::new(-0.5, 0.0, 0.7), Vec3::new(0.1, 0.2, -0.3)),
            ),
            (
                SpatialPose::new(Vec3::new(1.0, -1.0, 0.5), Vec3::new(0.0, 0.0, 2.5)),
                SpatialPose::new(Vec3::new(0.0, 0.3, 0.0), Vec3::new(-1.1, 0.4, 0.9)),
            ),
        ];
        for (p, q) in cases {
            let recovered = p.invert().chain(&p.chain(&q));
            // Angle recovery can wrap, so compare rotation matrices and
            // translations instead of raw rpy.
            assert_rotation_eq(&recovered.rotation(), &q.rotation(), 1e-9);
            assert_abs_diff_eq!(recovered.translation.x, q.translation.x, epsilon = 1e-9);
            assert_abs_diff_eq!(recovered.translation.y, q.translation.y, epsilon = 1e-9);
            assert_abs_diff_eq!(recovered.translation.z, q.translation.z, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_spatial_matrix_roundtrip_at_gimbal_lock() {
        // pitch = pi/2 hits the singular branch of rpy recovery; the
        // recovered pose must still rebuild the same rotation.
        let p = SpatialPose::new(Vec3::new(0.1, 0.2, 0.3), Vec3::new(0.4, FRAC_PI_2, 0.8));
        let rot = p.rotation();
        let recovered_rpy = SpatialPose::rpy_from_rotation(&rot);
        let rebuilt = SpatialPose::new(p.translation, recovered_rpy).rotation();
        assert_rotation_eq(&rebuilt, &rot, 1e-6);
        // The singular branch pins yaw to zero
        assert_abs_diff_eq!(recovered_rpy.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_spatial_chain_inverse_law_through_gimbal_lock() {
        let p = SpatialPose::new(Vec3::new(0.0, 0.5, 0.0), Vec3::new(0.0, FRAC_PI_2, 0.0));
        let q = SpatialPose::new(Vec3::new(0.2, -0.1, 0.4), Vec3::new(0.3, 0.1, -0.2));
        let recovered = p.invert().chain(&p.chain(&q));
        assert_rotation_eq(&recovered.rotation(), &q.rotation(), 1e-6);
        assert_abs_diff_eq!(recovered.translation.x, q.translation.x, epsilon = 1e-6);
        assert_abs_diff_eq!(recovered.translation.y, q.translation.y, epsilon = 1e-6);
        assert_abs_diff_eq!(recovered.translation.z, q.translation.z, epsilon = 1e-6);
    }

    #[test]
    fn test_quaternion_pose_roundtrip() {
        let p = SpatialPose::new(Vec3::new(0.4, -0.2, 0.9), Vec3::new(0.3, 0.5, -1.1));
        let q = p.to_quaternion_pose();
        // Unit quaternion
        let norm: f64 = q[..4].iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-12);

        let back = SpatialPose::from_quaternion_pose(&q);
        assert_rotation_eq(&back.rotation(), &p.rotation(), 1e-9);
        assert_abs_diff_eq!(back.translation.x, p.translation.x, epsilon = 1e-12);
    }

    #[test]
    fn test_yaw_only_quaternion_matches_planar() {
        // A yaw-only spatial pose should serialize to a quaternion that is
        // a pure z rotation.
        let p = SpatialPose::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        let q = p.to_quaternion_pose();
        assert_abs_diff_eq!(q[0], (0.5f64).cos(), epsilon = 1e-12);
        assert_abs_diff_eq!(q[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[2], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[3], (0.5f64).sin(), epsilon = 1e-12);
    }
}
