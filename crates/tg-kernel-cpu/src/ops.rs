use tg_core::Element;

use crate::math::{Comparable, Numeric, Real, Signed};

pub trait UnaryOp<T>: Copy + Send + Sync {
    fn func(&self, x: T) -> T;
}

pub trait BinaryOp<T>: Copy + Send + Sync {
    fn func(&self, lhs: T, rhs: T) -> T;
}

pub trait CompareOp<T>: Copy + Send + Sync {
    fn test(&self, lhs: T, rhs: T) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbsOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct NegOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SignOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SqrtOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SinOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct CosOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct TanOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct TanhOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmoidOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct FloorOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct CeilOp;

impl<T: Signed> UnaryOp<T> for AbsOp {
    fn func(&self, x: T) -> T {
        x.abs()
    }
}

impl<T: Signed> UnaryOp<T> for NegOp {
    fn func(&self, x: T) -> T {
        x.neg()
    }
}

impl<T: Signed> UnaryOp<T> for SignOp {
    fn func(&self, x: T) -> T {
        x.sign()
    }
}

impl<T: Numeric> UnaryOp<T> for SquaredOp {
    fn func(&self, x: T) -> T {
        x.mul(x)
    }
}

macro_rules! real_unary {
    ($($op:ident => $method:ident),* $(,)?) => {
        $(
            impl<T: Real> UnaryOp<T> for $op {
                fn func(&self, x: T) -> T {
                    x.$method()
                }
            }
        )*
    };
}

real_unary!(
    SqrtOp => sqrt,
    ExpOp => exp,
    LogOp => ln,
    SinOp => sin,
    CosOp => cos,
    TanOp => tan,
    TanhOp => tanh,
    FloorOp => floor,
    CeilOp => ceil,
);

impl<T: Real> UnaryOp<T> for SigmoidOp {
    fn func(&self, x: T) -> T {
        T::one().div(T::one().add(x.neg().exp()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct SubOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct MulOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct DivOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct MinOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct PowOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct AndOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct OrOp;

impl<T: Numeric> BinaryOp<T> for AddOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.add(rhs)
    }
}

impl<T: Numeric> BinaryOp<T> for SubOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.sub(rhs)
    }
}

impl<T: Numeric> BinaryOp<T> for MulOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.mul(rhs)
    }
}

impl<T: Numeric> BinaryOp<T> for DivOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.div(rhs)
    }
}

impl<T: Comparable> BinaryOp<T> for MinOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.min_of(rhs)
    }
}

impl<T: Comparable> BinaryOp<T> for MaxOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.max_of(rhs)
    }
}

impl<T: Real> BinaryOp<T> for PowOp {
    fn func(&self, lhs: T, rhs: T) -> T {
        lhs.powf(rhs)
    }
}

impl BinaryOp<bool> for AndOp {
    fn func(&self, lhs: bool, rhs: bool) -> bool {
        lhs && rhs
    }
}

impl BinaryOp<bool> for OrOp {
    fn func(&self, lhs: bool, rhs: bool) -> bool {
        lhs || rhs
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EqualOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct NotEqualOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct LessOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct LessOrEqualOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct GreaterOp;
#[derive(Debug, Clone, Copy, Default)]
pub struct GreaterOrEqualOp;

impl<T: Element> CompareOp<T> for EqualOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs == rhs
    }
}

impl<T: Element> CompareOp<T> for NotEqualOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs != rhs
    }
}

impl<T: Comparable> CompareOp<T> for LessOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs < rhs
    }
}

impl<T: Comparable> CompareOp<T> for LessOrEqualOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs <= rhs
    }
}

impl<T: Comparable> CompareOp<T> for GreaterOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs > rhs
    }
}

impl<T: Comparable> CompareOp<T> for GreaterOrEqualOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        lhs >= rhs
    }
}

/// `|lhs - rhs| <= tolerance`, evaluated in f64.
#[derive(Debug, Clone, Copy)]
pub struct AlmostEqualOp {
    pub tolerance: f64,
}

impl<T: Real> CompareOp<T> for AlmostEqualOp {
    fn test(&self, lhs: T, rhs: T) -> bool {
        (lhs.to_f64() - rhs.to_f64()).abs() <= self.tolerance
    }
}

/// Folding rule of a reduction. `map` is applied to every input element
/// before it is combined; `finalize` sees the number of folded elements.
pub trait Reducer<T>: Copy + Send + Sync {
    fn identity(&self) -> T;

    fn map(&self, value: T) -> T {
        value
    }

    fn combine(&self, acc: T, value: T) -> T;

    fn finalize(&self, acc: T, _count: usize) -> T {
        acc
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct ProdReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct ProdNonZerosReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct MinReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsSumReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct AllReducer;
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyReducer;

impl<T: Numeric> Reducer<T> for SumReducer {
    fn identity(&self) -> T {
        T::zero()
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.add(value)
    }
}

impl<T: Numeric> Reducer<T> for MeanReducer {
    fn identity(&self) -> T {
        T::zero()
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.add(value)
    }

    fn finalize(&self, acc: T, count: usize) -> T {
        acc.div_count(count)
    }
}

impl<T: Numeric> Reducer<T> for ProdReducer {
    fn identity(&self) -> T {
        T::one()
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.mul(value)
    }
}

impl<T: Numeric> Reducer<T> for ProdNonZerosReducer {
    fn identity(&self) -> T {
        T::one()
    }

    fn map(&self, value: T) -> T {
        if value.is_zero() { T::one() } else { value }
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.mul(value)
    }
}

impl<T: Comparable> Reducer<T> for MinReducer {
    fn identity(&self) -> T {
        T::HIGHEST
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.min_of(value)
    }
}

impl<T: Comparable> Reducer<T> for MaxReducer {
    fn identity(&self) -> T {
        T::LOWEST
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.max_of(value)
    }
}

impl<T: Signed> Reducer<T> for AbsSumReducer {
    fn identity(&self) -> T {
        T::zero()
    }

    fn map(&self, value: T) -> T {
        value.abs()
    }

    fn combine(&self, acc: T, value: T) -> T {
        acc.add(value)
    }
}

impl Reducer<bool> for AllReducer {
    fn identity(&self) -> bool {
        true
    }

    fn combine(&self, acc: bool, value: bool) -> bool {
        acc && value
    }
}

impl Reducer<bool> for AnyReducer {
    fn identity(&self) -> bool {
        false
    }

    fn combine(&self, acc: bool, value: bool) -> bool {
        acc || value
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AbsSumReducer, AlmostEqualOp, BinaryOp, CompareOp, DivOp, LessOp, MeanReducer,
        MinReducer, ProdNonZerosReducer, Reducer, SigmoidOp, SignOp, UnaryOp,
    };

    fn fold<T: Copy, R: Reducer<T>>(reducer: R, values: &[T]) -> T {
        let acc = values
            .iter()
            .fold(reducer.identity(), |acc, value| reducer.combine(acc, reducer.map(*value)));
        reducer.finalize(acc, values.len())
    }

    #[test]
    fn unary_ops_apply_elementwise_rules() {
        assert_eq!(SignOp.func(-4i32), -1);
        assert_eq!(SigmoidOp.func(0.0f64), 0.5);
    }

    #[test]
    fn binary_and_compare_ops() {
        assert_eq!(DivOp.func(9u8, 0), 0);
        assert!(LessOp.test(-1i8, 0));
        assert!(AlmostEqualOp { tolerance: 1e-3 }.test(1.0f32, 1.0005));
        assert!(!AlmostEqualOp { tolerance: 1e-3 }.test(1.0f32, 1.01));
    }

    #[test]
    fn reducers_fold_with_identity_and_finalize() {
        assert_eq!(fold(MeanReducer, &[1.0f64, 2.0, 6.0]), 3.0);
        assert_eq!(fold(ProdNonZerosReducer, &[2i32, 0, 3]), 6);
        assert_eq!(fold(AbsSumReducer, &[-2i16, 3, -4]), 9);
        assert_eq!(fold(MinReducer, &[] as &[f32]), f32::INFINITY);
    }

    #[test]
    fn integer_mean_divides_by_the_full_count() {
        let mut bytes = vec![0u8; 300];
        bytes[..10].fill(20);
        assert_eq!(fold(MeanReducer, &bytes), 0);

        let mut bytes = vec![0u8; 256];
        bytes[0] = 255;
        assert_eq!(fold(MeanReducer, &bytes), 0);

        let words = vec![3i16; 300];
        assert_eq!(fold(MeanReducer, &words), 3);
        let shorts = vec![-1i8; 128];
        assert_eq!(fold(MeanReducer, &shorts), -1);
    }
}
