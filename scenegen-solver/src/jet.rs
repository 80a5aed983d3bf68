//! Dual number (Jet) type for forward-mode automatic differentiation
//!
//! A Jet<N> represents an f64 value along with its derivatives with respect
//! to N parameters. The projection solver uses jets to get exact constraint
//! Jacobians instead of finite differences.

use std::ops::{Add, Div, Mul, Neg, Sub};

/// A dual number containing a value and its derivatives
///
/// Generic over N, the number of parameters (compile-time constant).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jet<const N: usize> {
    /// The scalar value
    pub value: f64,
    /// Derivatives with respect to each parameter
    pub derivs: [f64; N],
}

impl<const N: usize> Jet<N> {
    /// Create a constant (zero derivatives)
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            derivs: [0.0; N],
        }
    }

    /// Create a variable with unit derivative at the given index
    pub fn variable(value: f64, index: usize) -> Self {
        let mut derivs = [0.0; N];
        derivs[index] = 1.0;
        Self { value, derivs }
    }

    /// Check for NaN in value and all derivatives (debug builds only)
    #[inline]
    #[allow(unused_variables)]
    fn check_nan(&self, operation: &str) {
        #[cfg(debug_assertions)]
        {
            if self.value.is_nan() {
                panic!("NaN detected in {} operation! Value is NaN", operation);
            }
            for (i, &deriv) in self.derivs.iter().enumerate() {
                if deriv.is_nan() {
                    panic!(
                        "NaN detected in {} operation! Derivative {} is NaN (value: {})",
                        operation, i, self.value
                    );
                }
            }
        }
    }
}

// ============================================================================
// Arithmetic Operations
// ============================================================================

/// Addition: (a + da) + (b + db) = (a + b) + (da + db)
impl<const N: usize> Add for Jet<N> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let result = Self {
            value: self.value + rhs.value,
            derivs: std::array::from_fn(|i| self.derivs[i] + rhs.derivs[i]),
        };
        result.check_nan("add");
        result
    }
}

/// Subtraction: (a + da) - (b + db) = (a - b) + (da - db)
impl<const N: usize> Sub for Jet<N> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        let result = Self {
            value: self.value - rhs.value,
            derivs: std::array::from_fn(|i| self.derivs[i] - rhs.derivs[i]),
        };
        result.check_nan("sub");
        result
    }
}

/// Multiplication: (a + da) * (b + db) = ab + a*db + b*da
impl<const N: usize> Mul for Jet<N> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let result = Self {
            value: self.value * rhs.value,
            derivs: std::array::from_fn(|i| {
                self.value * rhs.derivs[i] + rhs.value * self.derivs[i]
            }),
        };
        result.check_nan("mul");
        result
    }
}

/// Division: (a + da) / (b + db) = a/b + (da*b - a*db)/b²
impl<const N: usize> Div for Jet<N> {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        let b_squared = rhs.value * rhs.value;
        let result = Self {
            value: self.value / rhs.value,
            derivs: std::array::from_fn(|i| {
                (self.derivs[i] * rhs.value - self.value * rhs.derivs[i]) / b_squared
            }),
        };
        result.check_nan("div");
        result
    }
}

/// Negation: -(a + da) = -a + (-da)
impl<const N: usize> Neg for Jet<N> {
    type Output = Self;

    fn neg(self) -> Self {
        let result = Self {
            value: -self.value,
            derivs: std::array::from_fn(|i| -self.derivs[i]),
        };
        result.check_nan("neg");
        result
    }
}

// ============================================================================
// Mathematical Functions
// ============================================================================

const DERIV_EPSILON: f64 = 1e-16;

impl<const N: usize> Jet<N> {
    /// Sine: sin(a + da) = sin(a) + cos(a) * da
    pub fn sin(self) -> Self {
        let sin_a = self.value.sin();
        let cos_a = self.value.cos();
        let result = Self {
            value: sin_a,
            derivs: std::array::from_fn(|i| cos_a * self.derivs[i]),
        };
        result.check_nan("sin");
        result
    }

    /// Cosine: cos(a + da) = cos(a) - sin(a) * da
    pub fn cos(self) -> Self {
        let sin_a = self.value.sin();
        let cos_a = self.value.cos();
        let result = Self {
            value: cos_a,
            derivs: std::array::from_fn(|i| -sin_a * self.derivs[i]),
        };
        result.check_nan("cos");
        result
    }

    /// Square root: sqrt(a + da) = sqrt(a) + da/(2*sqrt(a))
    pub fn sqrt(self) -> Self {
        let sqrt_a = self.value.sqrt();
        // Safe derivative: add epsilon to avoid division by zero
        let deriv_factor = 1.0 / (2.0 * (sqrt_a + DERIV_EPSILON));
        let result = Self {
            value: sqrt_a,
            derivs: std::array::from_fn(|i| deriv_factor * self.derivs[i]),
        };
        result.check_nan("sqrt");
        result
    }

    /// Power: (a + da)^n ≈ a^n + n*a^(n-1) * da
    pub fn powi(self, n: i32) -> Self {
        let value = self.value.powi(n);
        let deriv_factor = (n as f64) * self.value.powi(n - 1);
        let result = Self {
            value,
            derivs: std::array::from_fn(|i| deriv_factor * self.derivs[i]),
        };
        result.check_nan("powi");
        result
    }

    /// Natural exponential: exp(a + da) = exp(a) + exp(a) * da
    pub fn exp(self) -> Self {
        let exp_a = self.value.exp();
        let result = Self {
            value: exp_a,
            derivs: std::array::from_fn(|i| exp_a * self.derivs[i]),
        };
        result.check_nan("exp");
        result
    }

    /// Natural logarithm: ln(a + da) = ln(a) + da/a
    pub fn ln(self) -> Self {
        let deriv_factor = 1.0 / (self.value + DERIV_EPSILON);
        let result = Self {
            value: self.value.ln(),
            derivs: std::array::from_fn(|i| deriv_factor * self.derivs[i]),
        };
        result.check_nan("ln");
        result
    }

    /// Absolute value (non-differentiable at 0, uses sign)
    pub fn abs(self) -> Self {
        let sign = self.value.signum();
        let result = Self {
            value: self.value.abs(),
            derivs: std::array::from_fn(|i| sign * self.derivs[i]),
        };
        result.check_nan("abs");
        result
    }

    /// Hinge: max(0, a). Zero value and zero derivatives on the inactive side.
    ///
    /// Used for one-sided penalty residuals (separation and bound
    /// constraints): inactive constraints contribute nothing to the
    /// Jacobian, which is what makes the implicit-function sensitivity at
    /// the solution pick up only the active set.
    pub fn hinge(self) -> Self {
        if self.value > 0.0 {
            self
        } else {
            Self::constant(0.0)
        }
    }
}

// ============================================================================
// Real trait for generic programming
// ============================================================================

/// Trait for types that support real number operations
///
/// Implemented for both f64 and Jet<N>, allowing generic code
/// that works with or without automatic differentiation.
pub trait Real:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Sized
{
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn sqrt(self) -> Self;
    fn abs(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn hinge(self) -> Self;

    /// Convert f64 to Self (works for literals and constants)
    fn from_literal(value: f64) -> Self;

    fn zero() -> Self;
    fn one() -> Self;
}

/// Real implementation for f64 (no autodiff)
impl Real for f64 {
    fn sin(self) -> Self {
        f64::sin(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn hinge(self) -> Self {
        self.max(0.0)
    }
    fn from_literal(value: f64) -> Self {
        value
    }
    fn zero() -> Self {
        0.0
    }
    fn one() -> Self {
        1.0
    }
}

/// Real implementation for Jet
impl<const N: usize> Real for Jet<N> {
    fn sin(self) -> Self {
        self.sin()
    }
    fn cos(self) -> Self {
        self.cos()
    }
    fn sqrt(self) -> Self {
        self.sqrt()
    }
    fn abs(self) -> Self {
        self.abs()
    }
    fn powi(self, n: i32) -> Self {
        self.powi(n)
    }
    fn exp(self) -> Self {
        self.exp()
    }
    fn ln(self) -> Self {
        self.ln()
    }
    fn hinge(self) -> Self {
        self.hinge()
    }
    fn from_literal(value: f64) -> Self {
        Jet::constant(value)
    }
    fn zero() -> Self {
        Jet::constant(0.0)
    }
    fn one() -> Self {
        Jet::constant(1.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
