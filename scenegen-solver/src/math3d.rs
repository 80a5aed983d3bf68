//! Small-vector math primitives with automatic differentiation support
//!
//! Provides Vec2, Vec3 and Mat3 types that work generically with any Real
//! type, enabling the same geometry code to run with or without autodiff.

use crate::Real;

// ============================================================================
// Vec2 - 2D Vector
// ============================================================================

/// 2D vector generic over any Real type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2<T> {
    pub x: T,
    pub y: T,
}

impl<T: Copy> Vec2<T> {
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl<T: Real> Vec2<T> {
    /// Create a zero vector
    pub fn zero() -> Self {
        Self {
            x: T::zero(),
            y: T::zero(),
        }
    }

    /// Dot product
    pub fn dot(self, other: Self) -> T {
        self.x * other.x + self.y * other.y
    }

    /// Length squared
    pub fn length_squared(self) -> T {
        self.dot(self)
    }

    /// Length (magnitude)
    pub fn length(self) -> T {
        self.length_squared().sqrt()
    }

    /// Rotate by an angle (counter-clockwise)
    pub fn rotate(self, angle: T) -> Self {
        let c = angle.cos();
        let s = angle.sin();
        Self {
            x: self.x * c - self.y * s,
            y: self.x * s + self.y * c,
        }
    }
}

impl<T: Real> std::ops::Add for Vec2<T> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

impl<T: Real> std::ops::Sub for Vec2<T> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }
}

// ============================================================================
// Vec3 - 3D Vector
// ============================================================================

/// 3D vector generic over any Real type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Copy> Vec3<T> {
    pub const fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }
}

impl<T: Real> Vec3<T> {
    /// Create a zero vector
    pub fn zero() -> Self {
        Self {
            x: T::zero(),
            y: T::zero(),
            z: T::zero(),
        }
    }

    /// Dot product
    pub fn dot(self, other: Self) -> T {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Length squared
    pub fn length_squared(self) -> T {
        self.dot(self)
    }

    /// Length (magnitude)
    pub fn length(self) -> T {
        self.length_squared().sqrt()
    }

    /// Cross product
    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }
}

impl<T: Real> std::ops::Add for Vec3<T> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

impl<T: Real> std::ops::Sub for Vec3<T> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }
}

impl<T: Real> std::ops::Neg for Vec3<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

// ============================================================================
// Mat3 - 3x3 Matrix (column-major)
// ============================================================================

/// 3x3 matrix stored in column-major order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3<T> {
    pub x_axis: Vec3<T>,
    pub y_axis: Vec3<T>,
    pub z_axis: Vec3<T>,
}

impl<T: Copy> Mat3<T> {
    pub const fn from_cols(x_axis: Vec3<T>, y_axis: Vec3<T>, z_axis: Vec3<T>) -> Self {
        Self {
            x_axis,
            y_axis,
            z_axis,
        }
    }

    /// Element accessors (row, column)
    pub fn m00(&self) -> T { self.x_axis.x }
    pub fn m10(&self) -> T { self.x_axis.y }
    pub fn m20(&self) -> T { self.x_axis.z }
    pub fn m01(&self) -> T { self.y_axis.x }
    pub fn m11(&self) -> T { self.y_axis.y }
    pub fn m21(&self) -> T { self.y_axis.z }
    pub fn m02(&self) -> T { self.z_axis.x }
    pub fn m12(&self) -> T { self.z_axis.y }
    pub fn m22(&self) -> T { self.z_axis.z }
}

impl<T: Real> Mat3<T> {
    /// Identity matrix
    pub fn identity() -> Self {
        Self {
            x_axis: Vec3::new(T::one(), T::zero(), T::zero()),
            y_axis: Vec3::new(T::zero(), T::one(), T::zero()),
            z_axis: Vec3::new(T::zero(), T::zero(), T::one()),
        }
    }

    /// Transpose matrix
    pub fn transpose(self) -> Self {
        Self {
            x_axis: Vec3::new(self.x_axis.x, self.y_axis.x, self.z_axis.x),
            y_axis: Vec3::new(self.x_axis.y, self.y_axis.y, self.z_axis.y),
            z_axis: Vec3::new(self.x_axis.z, self.y_axis.z, self.z_axis.z),
        }
    }

    /// Multiply matrix by vector
    pub fn mul_vec(self, v: Vec3<T>) -> Vec3<T> {
        Vec3 {
            x: self.x_axis.x * v.x + self.y_axis.x * v.y + self.z_axis.x * v.z,
            y: self.x_axis.y * v.x + self.y_axis.y * v.y + self.z_axis.y * v.z,
            z: self.x_axis.z * v.x + self.y_axis.z * v.y + self.z_axis.z * v.z,
        }
    }
}

/// Matrix-matrix multiplication
impl<T: Real> std::ops::Mul for Mat3<T> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            x_axis: self.mul_vec(rhs.x_axis),
            y_axis: self.mul_vec(rhs.y_axis),
            z_axis: self.mul_vec(rhs.z_axis),
        }
    }
}

/// Build a rotation matrix from roll/pitch/yaw (x, y, z intrinsic order)
///
/// The composed matrix is Rz(yaw) * Ry(pitch) * Rx(roll), matching the
/// usual aerospace convention where roll is applied first.
pub fn mat3_from_rpy<T: Real>(roll: T, pitch: T, yaw: T) -> Mat3<T> {
    let (sr, cr) = (roll.sin(), roll.cos());
    let (sp, cp) = (pitch.sin(), pitch.cos());
    let (sy, cy) = (yaw.sin(), yaw.cos());

    let rot_x = Mat3::from_cols(
        Vec3::new(T::one(), T::zero(), T::zero()),
        Vec3::new(T::zero(), cr, sr),
        Vec3::new(T::zero(), -sr, cr),
    );
    let rot_y = Mat3::from_cols(
        Vec3::new(cp, T::zero(), -sp),
        Vec3::new(T::zero(), T::one(), T::zero()),
        Vec3::new(sp, T::zero(), cp),
    );
    let rot_z = Mat3::from_cols(
        Vec3::new(cy, sy, T::zero()),
        Vec3::new(-sy, cy, T::zero()),
        Vec3::new(T::zero(), T::zero(), T::one()),
    );
    rot_z * (rot_y * rot_x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_vec2_rotate() {
        // 90 degrees CCW maps +x to +y
        let v = Vec2::new(1.0, 0.0).rotate(PI / 2.0);
        assert_abs_diff_eq!(v.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mat3_identity_mul() {
        let m = mat3_from_rpy(0.3, -0.2, 0.9);
        let id = Mat3::<f64>::identity();
        let prod = id * m;
        assert_abs_diff_eq!(prod.m00(), m.m00(), epsilon = 1e-12);
        assert_abs_diff_eq!(prod.m21(), m.m21(), epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_orthonormal() {
        let m = mat3_from_rpy(0.4, 0.7, -1.1);
        let should_be_identity = m.transpose() * m;
        assert_abs_diff_eq!(should_be_identity.m00(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(should_be_identity.m11(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(should_be_identity.m22(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(should_be_identity.m01(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(should_be_identity.m12(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_yaw_rotation_matches_vec2() {
        // Yaw-only spatial rotation should act like the planar rotation on xy
        let yaw = 0.6;
        let m = mat3_from_rpy(0.0, 0.0, yaw);
        let v3 = m.mul_vec(Vec3::new(0.5, -0.25, 0.0));
        let v2 = Vec2::new(0.5, -0.25).rotate(yaw);
        assert_abs_diff_eq!(v3.x, v2.x, epsilon = 1e-12);
        assert_abs_diff_eq!(v3.y, v2.y, epsilon = 1e-12);
        assert_abs_diff_eq!(v3.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_with_jets() {
        use crate::Jet;

        type Jet3 = Jet<3>;
        let roll = Jet3::variable(0.2, 0);
        let pitch = Jet3::variable(0.3, 1);
        let yaw = Jet3::variable(0.1, 2);

        let m = mat3_from_rpy(roll, pitch, yaw);
        let p = m.mul_vec(Vec3::new(
            Jet3::constant(1.0),
            Jet3::constant(2.0),
            Jet3::constant(3.0),
        ));

        // Derivatives should flow through the rotation
        assert!(p.x.derivs.iter().any(|&d| d.abs() > 1e-10));
        assert!(p.y.derivs.iter().any(|&d| d.abs() > 1e-10));
        assert!(p.z.derivs.iter().any(|&d| d.abs() > 1e-10));
    }
}
