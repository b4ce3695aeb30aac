use tg_core::{Complex32, Element, bf16, f16};

/// Arithmetic every numeric element type supports. Integers wrap and
/// integer division by zero yields zero.
pub trait Numeric: Element {
    fn zero() -> Self;
    fn one() -> Self;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
    /// `self / count` with the count kept at full width; integers truncate
    /// toward zero and a zero count yields zero.
    fn div_count(self, count: usize) -> Self;

    fn is_zero(self) -> bool {
        self == Self::zero()
    }
}

pub trait Signed: Numeric {
    fn neg(self) -> Self;
    fn abs(self) -> Self;
    /// -1, 0 or 1; NaN stays NaN.
    fn sign(self) -> Self;
}

/// Totally or partially ordered numerics (everything but complex).
pub trait Comparable: Numeric + PartialOrd {
    const LOWEST: Self;
    const HIGHEST: Self;

    fn min_of(self, rhs: Self) -> Self {
        if rhs < self { rhs } else { self }
    }

    fn max_of(self, rhs: Self) -> Self {
        if rhs > self { rhs } else { self }
    }
}

pub trait Real: Signed + Comparable {
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn sqrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn tanh(self) -> Self;
    fn floor(self) -> Self;
    fn ceil(self) -> Self;
    fn powf(self, exponent: Self) -> Self;
}

macro_rules! integer_numeric {
    ($($ty:ty),*) => {
        $(
            impl Numeric for $ty {
                fn zero() -> Self {
                    0
                }

                fn one() -> Self {
                    1
                }

                fn add(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }

                fn sub(self, rhs: Self) -> Self {
                    self.wrapping_sub(rhs)
                }

                fn mul(self, rhs: Self) -> Self {
                    self.wrapping_mul(rhs)
                }

                fn div(self, rhs: Self) -> Self {
                    if rhs == 0 { 0 } else { self.wrapping_div(rhs) }
                }

                fn div_count(self, count: usize) -> Self {
                    match i64::try_from(count) {
                        Ok(0) => 0,
                        Ok(count) => (i64::from(self) / count) as $ty,
                        Err(_) => 0,
                    }
                }
            }

            impl Comparable for $ty {
                const LOWEST: Self = <$ty>::MIN;
                const HIGHEST: Self = <$ty>::MAX;
            }
        )*
    };
}

integer_numeric!(u8, i8, u16, i16, i32);

macro_rules! integer_signed {
    ($($ty:ty),*) => {
        $(
            impl Signed for $ty {
                fn neg(self) -> Self {
                    self.wrapping_neg()
                }

                fn abs(self) -> Self {
                    self.wrapping_abs()
                }

                fn sign(self) -> Self {
                    self.signum()
                }
            }
        )*
    };
}

integer_signed!(i8, i16, i32);

macro_rules! native_float {
    ($($ty:ty),*) => {
        $(
            impl Numeric for $ty {
                fn zero() -> Self {
                    0.0
                }

                fn one() -> Self {
                    1.0
                }

                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }

                fn sub(self, rhs: Self) -> Self {
                    self - rhs
                }

                fn mul(self, rhs: Self) -> Self {
                    self * rhs
                }

                fn div(self, rhs: Self) -> Self {
                    self / rhs
                }

                fn div_count(self, count: usize) -> Self {
                    (self as f64 / count as f64) as $ty
                }
            }

            impl Signed for $ty {
                fn neg(self) -> Self {
                    -self
                }

                fn abs(self) -> Self {
                    <$ty>::abs(self)
                }

                fn sign(self) -> Self {
                    if self > 0.0 {
                        1.0
                    } else if self < 0.0 {
                        -1.0
                    } else {
                        self
                    }
                }
            }

            impl Comparable for $ty {
                const LOWEST: Self = <$ty>::NEG_INFINITY;
                const HIGHEST: Self = <$ty>::INFINITY;
            }

            impl Real for $ty {
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn sqrt(self) -> Self {
                    <$ty>::sqrt(self)
                }

                fn exp(self) -> Self {
                    <$ty>::exp(self)
                }

                fn ln(self) -> Self {
                    <$ty>::ln(self)
                }

                fn sin(self) -> Self {
                    <$ty>::sin(self)
                }

                fn cos(self) -> Self {
                    <$ty>::cos(self)
                }

                fn tan(self) -> Self {
                    <$ty>::tan(self)
                }

                fn tanh(self) -> Self {
                    <$ty>::tanh(self)
                }

                fn floor(self) -> Self {
                    <$ty>::floor(self)
                }

                fn ceil(self) -> Self {
                    <$ty>::ceil(self)
                }

                fn powf(self, exponent: Self) -> Self {
                    <$ty>::powf(self, exponent)
                }
            }
        )*
    };
}

native_float!(f32, f64);

// Half precision types round-trip every operation through f32.
macro_rules! half_float {
    ($($ty:ty),*) => {
        $(
            impl Numeric for $ty {
                fn zero() -> Self {
                    <$ty>::ZERO
                }

                fn one() -> Self {
                    <$ty>::ONE
                }

                fn add(self, rhs: Self) -> Self {
                    <$ty>::from_f32(self.to_f32() + rhs.to_f32())
                }

                fn sub(self, rhs: Self) -> Self {
                    <$ty>::from_f32(self.to_f32() - rhs.to_f32())
                }

                fn mul(self, rhs: Self) -> Self {
                    <$ty>::from_f32(self.to_f32() * rhs.to_f32())
                }

                fn div(self, rhs: Self) -> Self {
                    <$ty>::from_f32(self.to_f32() / rhs.to_f32())
                }

                fn div_count(self, count: usize) -> Self {
                    <$ty>::from_f64(self.to_f64() / count as f64)
                }
            }

            impl Signed for $ty {
                fn neg(self) -> Self {
                    -self
                }

                fn abs(self) -> Self {
                    <$ty>::from_f32(self.to_f32().abs())
                }

                fn sign(self) -> Self {
                    <$ty>::from_f32(Signed::sign(self.to_f32()))
                }
            }

            impl Comparable for $ty {
                const LOWEST: Self = <$ty>::NEG_INFINITY;
                const HIGHEST: Self = <$ty>::INFINITY;
            }

            impl Real for $ty {
                fn from_f64(value: f64) -> Self {
                    <$ty>::from_f64(value)
                }

                fn to_f64(self) -> f64 {
                    <$ty>::to_f64(self)
                }

                fn sqrt(self) -> Self {
                    <$ty>::from_f32(self.to_f32().sqrt())
                }

                fn exp(self) -> Self {
                    <$ty>::from_f32(self.to_f32().exp())
                }

                fn ln(self) -> Self {
                    <$ty>::from_f32(self.to_f32().ln())
                }

                fn sin(self) -> Self {
                    <$ty>::from_f32(self.to_f32().sin())
                }

                fn cos(self) -> Self {
                    <$ty>::from_f32(self.to_f32().cos())
                }

                fn tan(self) -> Self {
                    <$ty>::from_f32(self.to_f32().tan())
                }

                fn tanh(self) -> Self {
                    <$ty>::from_f32(self.to_f32().tanh())
                }

                fn floor(self) -> Self {
                    <$ty>::from_f32(self.to_f32().floor())
                }

                fn ceil(self) -> Self {
                    <$ty>::from_f32(self.to_f32().ceil())
                }

                fn powf(self, exponent: Self) -> Self {
                    <$ty>::from_f32(self.to_f32().powf(exponent.to_f32()))
                }
            }
        )*
    };
}

half_float!(f16, bf16);

impl Numeric for Complex32 {
    fn zero() -> Self {
        Complex32::new(0.0, 0.0)
    }

    fn one() -> Self {
        Complex32::new(1.0, 0.0)
    }

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn sub(self, rhs: Self) -> Self {
        self - rhs
    }

    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }

    fn div(self, rhs: Self) -> Self {
        self / rhs
    }

    fn div_count(self, count: usize) -> Self {
        let count = count as f64;
        Complex32::new(
            (f64::from(self.re) / count) as f32,
            (f64::from(self.im) / count) as f32,
        )
    }
}

#[cfg(test)]
mod tests {
    use tg_core::{Complex32, bf16, f16};

    use super::{Comparable, Numeric, Real, Signed};

    #[test]
    fn integer_arithmetic_wraps_and_division_by_zero_is_zero() {
        assert_eq!(Numeric::add(250u8, 10), 4);
        assert_eq!(Numeric::mul(i8::MAX, 2), -2);
        assert_eq!(Numeric::div(7i32, 0), 0);
        assert_eq!(Numeric::div(i32::MIN, -1), i32::MIN);
        assert_eq!(Signed::abs(i16::MIN), i16::MIN);
        assert_eq!(Signed::sign(-9i8), -1);
    }

    #[test]
    fn count_division_does_not_truncate_the_count() {
        assert_eq!(Numeric::div_count(200u8, 300), 0);
        assert_eq!(Numeric::div_count(255u8, 256), 0);
        assert_eq!(Numeric::div_count(-100i8, 50), -2);
        assert_eq!(Numeric::div_count(i8::MIN, 128), -1);
        assert_eq!(Numeric::div_count(30_000i16, 40_000), 0);
        assert_eq!(Numeric::div_count(i32::MIN, 1), i32::MIN);
        assert_eq!(Numeric::div_count(7i32, 0), 0);
        assert_eq!(Numeric::div_count(f16::from_f32(3.0), 2).to_f32(), 1.5);
        assert_eq!(
            Numeric::div_count(Complex32::new(3.0, -6.0), 3),
            Complex32::new(1.0, -2.0)
        );
    }

    #[test]
    fn float_sign_keeps_zero_and_nan() {
        assert_eq!(Signed::sign(-0.0f32).to_bits(), (-0.0f32).to_bits());
        assert!(Signed::sign(f64::NAN).is_nan());
        assert_eq!(Signed::sign(3.5f64), 1.0);
    }

    #[test]
    fn half_types_compute_through_f32() {
        let lhs = f16::from_f32(1.5);
        let rhs = f16::from_f32(2.25);
        assert_eq!(Numeric::mul(lhs, rhs).to_f32(), 3.375);
        assert_eq!(Real::sqrt(bf16::from_f32(16.0)).to_f32(), 4.0);
        assert_eq!(Comparable::min_of(lhs, rhs), lhs);
    }

    #[test]
    fn complex_arithmetic_is_field_arithmetic() {
        let lhs = Complex32::new(1.0, 2.0);
        let rhs = Complex32::new(3.0, -1.0);
        assert_eq!(Numeric::mul(lhs, rhs), Complex32::new(5.0, 5.0));
        assert!(Numeric::is_zero(Complex32::zero()));
    }
}
