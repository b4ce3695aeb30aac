use std::collections::HashMap;
use std::sync::OnceLock;

use tg_core::{Complex32, DType, Element, Scalar, Storage, bf16, f16};
use tg_kernel_cpu::{
    AbsOp, AbsSumReducer, AddOp, AllReducer, AlmostEqualOp, AndOp, AnyReducer, BinaryOp, CeilOp,
    CompareOp, CosOp, DivOp, EqualOp, ExpOp, FloorOp, GreaterOp, GreaterOrEqualOp, KernelError,
    LaunchPlan, LessOp, LessOrEqualOp, LogOp, MaxOp, MaxReducer, MeanReducer, MinOp, MinReducer,
    MulOp, NegOp, NotEqualOp, Numeric, OrOp, PowOp, ProdNonZerosReducer, ProdReducer, RandomFill,
    Real, Reducer, Sampler, SigmoidOp, SignOp, SinOp, SqrtOp, SquaredOp, SubOp, SumReducer, TanOp,
    TanhOp, UnaryOp, launch_a, launch_ab, launch_abc, launch_o, launch_reduce_all,
    launch_reduce_axes, launch_seq,
};

use crate::{BinaryKind, CompareKind, LogicalKind, OpKey, Params, ReduceKind, UnaryKind};

/// Type-erased entry point: output storage first, then inputs in operand
/// order.
pub(crate) type Launcher =
    fn(&LaunchPlan, &Params, &mut Storage, &[&Storage]) -> Result<(), KernelError>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelEntry {
    pub(crate) name: &'static str,
    pub(crate) launcher: Launcher,
}

pub(crate) struct KernelTable {
    entries: HashMap<(OpKey, DType), KernelEntry>,
}

static KERNELS: OnceLock<KernelTable> = OnceLock::new();

pub(crate) fn kernel_table() -> &'static KernelTable {
    KERNELS.get_or_init(KernelTable::build)
}

/// Whether some kernel instantiation exists for `op` over `dtype`.
#[must_use]
pub fn is_supported(op: OpKey, dtype: DType) -> bool {
    kernel_table().lookup(op, dtype).is_some()
}

/// Every registered instantiation, ordered by kernel name.
#[must_use]
pub fn registered_kernels() -> Vec<(OpKey, DType, &'static str)> {
    let mut kernels = kernel_table()
        .entries
        .iter()
        .map(|((op, dtype), entry)| (*op, *dtype, entry.name))
        .collect::<Vec<_>>();
    kernels.sort_by_key(|(op, dtype, name)| (*name, *dtype, op.to_string()));
    kernels
}

fn operand<'s>(inputs: &[&'s Storage], index: usize) -> Result<&'s Storage, KernelError> {
    inputs
        .get(index)
        .copied()
        .ok_or(KernelError::MissingOperand { index })
}

fn typed<T: Element>(storage: &Storage) -> Result<&[T], KernelError> {
    storage
        .typed::<T>()
        .ok_or_else(|| storage_mismatch(storage.dtype(), T::DTYPE))
}

fn typed_mut<T: Element>(storage: &mut Storage) -> Result<&mut [T], KernelError> {
    let actual = storage.dtype();
    storage
        .typed_mut::<T>()
        .ok_or_else(|| storage_mismatch(actual, T::DTYPE))
}

fn storage_mismatch(actual: DType, expected: DType) -> KernelError {
    KernelError::InvalidParameter {
        reason: format!("storage holds {actual} elements, kernel expects {expected}"),
    }
}

fn element<T: Element>(value: Scalar) -> Result<T, KernelError> {
    T::from_scalar(value).ok_or_else(|| KernelError::InvalidParameter {
        reason: format!("{value:?} is not representable as {}", T::DTYPE),
    })
}

fn unexpected(params: &Params) -> KernelError {
    KernelError::InvalidParameter {
        reason: format!("launcher received mismatched parameters {params:?}"),
    }
}

fn unary<T, O>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError>
where
    T: Element,
    O: UnaryOp<T> + Default,
{
    let op = O::default();
    let a = typed::<T>(operand(inputs, 0)?)?;
    launch_a(plan, typed_mut::<T>(out)?, a, move |x| op.func(x))
}

fn binary<T, O>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError>
where
    T: Element,
    O: BinaryOp<T> + Default,
{
    let op = O::default();
    let a = typed::<T>(operand(inputs, 0)?)?;
    let b = typed::<T>(operand(inputs, 1)?)?;
    launch_ab(plan, typed_mut::<T>(out)?, a, b, move |x, y| op.func(x, y))
}

fn compare<T, O>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError>
where
    T: Element,
    O: CompareOp<T> + Default,
{
    let op = O::default();
    let a = typed::<T>(operand(inputs, 0)?)?;
    let b = typed::<T>(operand(inputs, 1)?)?;
    launch_ab(plan, typed_mut::<bool>(out)?, a, b, move |x, y| op.test(x, y))
}

fn almost_equal<T: Real>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError> {
    let Params::Tolerance(tolerance) = *params else {
        return Err(unexpected(params));
    };
    let op = AlmostEqualOp { tolerance };
    let a = typed::<T>(operand(inputs, 0)?)?;
    let b = typed::<T>(operand(inputs, 1)?)?;
    launch_ab(plan, typed_mut::<bool>(out)?, a, b, move |x, y| op.test(x, y))
}

fn replace<T: Element>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError> {
    let x = typed::<T>(operand(inputs, 0)?)?;
    let y = typed::<T>(operand(inputs, 1)?)?;
    let condition = typed::<bool>(operand(inputs, 2)?)?;
    launch_abc(
        plan,
        typed_mut::<T>(out)?,
        x,
        y,
        condition,
        |x, y, take| if take { y } else { x },
    )
}

fn multiply_add<T: Numeric>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError> {
    let a = typed::<T>(operand(inputs, 0)?)?;
    let b = typed::<T>(operand(inputs, 1)?)?;
    let c = typed::<T>(operand(inputs, 2)?)?;
    launch_abc(plan, typed_mut::<T>(out)?, a, b, c, |a, b, c| {
        a.mul(b).add(c)
    })
}

fn cast<S: Element, D: Element>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError> {
    let src = typed::<S>(operand(inputs, 0)?)?;
    launch_a(plan, typed_mut::<D>(out)?, src, |x| {
        D::from_scalar(x.to_scalar()).unwrap_or_default()
    })
}

fn fill<T: Element>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    _: &[&Storage],
) -> Result<(), KernelError> {
    let Params::Fill(value) = *params else {
        return Err(unexpected(params));
    };
    let value = element::<T>(value)?;
    launch_o(plan, typed_mut::<T>(out)?, move |_| value)
}

fn fill_range<T: Element>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    _: &[&Storage],
) -> Result<(), KernelError> {
    let Params::Range { first, last, step } = *params else {
        return Err(unexpected(params));
    };
    let real = |value: Scalar| {
        value.as_f64().ok_or_else(|| KernelError::InvalidParameter {
            reason: format!("range bound {value:?} is not real"),
        })
    };
    let (first, last, step) = (real(first)?, real(last)?, real(step)?);
    launch_seq(plan, typed_mut::<T>(out)?, move |sequence| {
        let value = first + f64::from(sequence) * step;
        let value = if step > 0.0 {
            value.min(last)
        } else if step < 0.0 {
            value.max(last)
        } else {
            value
        };
        T::from_scalar(Scalar::Float(value)).unwrap_or_default()
    })
}

fn eye<T: Element>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    _: &[&Storage],
) -> Result<(), KernelError> {
    let Params::Eye { offset } = *params else {
        return Err(unexpected(params));
    };
    let one = element::<T>(Scalar::Int(1))?;
    let zero = T::default();
    launch_o(plan, typed_mut::<T>(out)?, move |coords| match coords {
        [row, col] if i64::from(*col) - i64::from(*row) == offset => one,
        _ => zero,
    })
}

fn random<T: Real>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    _: &[&Storage],
) -> Result<(), KernelError> {
    let Params::Random { fill, seed } = *params else {
        return Err(unexpected(params));
    };
    let sampler = Sampler::new(fill, seed)?;
    launch_seq(plan, typed_mut::<T>(out)?, move |sequence| {
        T::from_f64(sampler.sample(sequence))
    })
}

fn random_from<T: Real>(
    plan: &LaunchPlan,
    params: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError> {
    let Params::RandomFrom { truncated, seed } = *params else {
        return Err(unexpected(params));
    };
    let mean = first_element::<T>(plan, inputs, 0)?.to_f64();
    let std = first_element::<T>(plan, inputs, 1)?.to_f64();
    let fill = if truncated {
        RandomFill::TruncatedNormal { mean, std }
    } else {
        RandomFill::Normal { mean, std }
    };
    let sampler = Sampler::new(fill, seed)?;
    launch_seq(plan, typed_mut::<T>(out)?, move |sequence| {
        T::from_f64(sampler.sample(sequence))
    })
}

/// The element an input view starts at.
fn first_element<T: Element>(
    plan: &LaunchPlan,
    inputs: &[&Storage],
    slot: usize,
) -> Result<T, KernelError> {
    let offset = plan.input(slot)?.desc.storage_offset();
    let values = typed::<T>(operand(inputs, slot)?)?;
    values
        .get(offset)
        .copied()
        .ok_or(KernelError::InsufficientStorage {
            side: "input",
            needed: offset + 1,
            available: values.len(),
        })
}

fn reduce<T, Red>(
    plan: &LaunchPlan,
    _: &Params,
    out: &mut Storage,
    inputs: &[&Storage],
) -> Result<(), KernelError>
where
    T: Element,
    Red: Reducer<T> + Default,
{
    let a = typed::<T>(operand(inputs, 0)?)?;
    let out = typed_mut::<T>(out)?;
    if plan.reduced_axes.is_empty() {
        launch_reduce_all(plan, out, a, Red::default())
    } else {
        launch_reduce_axes(plan, out, a, Red::default())
    }
}

macro_rules! register {
    ($table:ident, $key:expr, $template:literal, $launcher:ident<$op:ty>, [$($ty:ty),+ $(,)?]) => {
        $(
            $table.insert(
                ($key, <$ty as Element>::DTYPE),
                KernelEntry {
                    name: concat!($template, "<", stringify!($ty), ">"),
                    launcher: $launcher::<$ty, $op>,
                },
            );
        )+
    };
    ($table:ident, $key:expr, $template:literal, $launcher:ident, [$($ty:ty),+ $(,)?]) => {
        $(
            $table.insert(
                ($key, <$ty as Element>::DTYPE),
                KernelEntry {
                    name: concat!($template, "<", stringify!($ty), ">"),
                    launcher: $launcher::<$ty>,
                },
            );
        )+
    };
}

macro_rules! floats {
    ($m:ident!($($args:tt)*)) => {
        $m!($($args)*, [f16, bf16, f32, f64])
    };
}

macro_rules! signed {
    ($m:ident!($($args:tt)*)) => {
        $m!($($args)*, [i8, i16, i32, f16, bf16, f32, f64])
    };
}

macro_rules! comparable {
    ($m:ident!($($args:tt)*)) => {
        $m!($($args)*, [u8, i8, u16, i16, i32, f16, bf16, f32, f64])
    };
}

macro_rules! numeric {
    ($m:ident!($($args:tt)*)) => {
        $m!($($args)*, [u8, i8, u16, i16, i32, f16, bf16, f32, f64, Complex32])
    };
}

macro_rules! every {
    ($m:ident!($($args:tt)*)) => {
        $m!($($args)*, [bool, u8, i8, u16, i16, i32, f16, bf16, f32, f64, Complex32])
    };
}

macro_rules! register_casts {
    ($table:ident, $src:ty => [$($dst:ty),+ $(,)?]) => {
        $(
            $table.insert(
                (
                    OpKey::Cast {
                        to: <$dst as Element>::DTYPE,
                    },
                    <$src as Element>::DTYPE,
                ),
                KernelEntry {
                    name: concat!("map_a<", stringify!($src), "->", stringify!($dst), ">"),
                    launcher: cast::<$src, $dst>,
                },
            );
        )+
    };
}

macro_rules! register_real_casts {
    ($table:ident, $($src:ty),+ $(,)?) => {
        $(
            register_casts!(
                $table,
                $src => [bool, u8, i8, u16, i16, i32, f16, bf16, f32, f64, Complex32]
            );
        )+
    };
}

impl KernelTable {
    pub(crate) fn lookup(&self, op: OpKey, dtype: DType) -> Option<KernelEntry> {
        self.entries.get(&(op, dtype)).copied()
    }

    fn build() -> Self {
        let mut table = HashMap::new();

        signed!(register!(table, OpKey::Unary(UnaryKind::Abs), "map_a", unary<AbsOp>));
        signed!(register!(table, OpKey::Unary(UnaryKind::Neg), "map_a", unary<NegOp>));
        signed!(register!(table, OpKey::Unary(UnaryKind::Sign), "map_a", unary<SignOp>));
        numeric!(register!(table, OpKey::Unary(UnaryKind::Squared), "map_a", unary<SquaredOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Sqrt), "map_a", unary<SqrtOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Exp), "map_a", unary<ExpOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Log), "map_a", unary<LogOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Sin), "map_a", unary<SinOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Cos), "map_a", unary<CosOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Tan), "map_a", unary<TanOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Tanh), "map_a", unary<TanhOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Sigmoid), "map_a", unary<SigmoidOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Floor), "map_a", unary<FloorOp>));
        floats!(register!(table, OpKey::Unary(UnaryKind::Ceil), "map_a", unary<CeilOp>));

        numeric!(register!(table, OpKey::Binary(BinaryKind::Add), "map_ab", binary<AddOp>));
        numeric!(register!(table, OpKey::Binary(BinaryKind::Sub), "map_ab", binary<SubOp>));
        numeric!(register!(table, OpKey::Binary(BinaryKind::Mul), "map_ab", binary<MulOp>));
        numeric!(register!(table, OpKey::Binary(BinaryKind::Div), "map_ab", binary<DivOp>));
        comparable!(register!(table, OpKey::Binary(BinaryKind::Min), "map_ab", binary<MinOp>));
        comparable!(register!(table, OpKey::Binary(BinaryKind::Max), "map_ab", binary<MaxOp>));
        floats!(register!(table, OpKey::Binary(BinaryKind::Pow), "map_ab", binary<PowOp>));
        register!(table, OpKey::Logical(LogicalKind::And), "map_ab", binary<AndOp>, [bool]);
        register!(table, OpKey::Logical(LogicalKind::Or), "map_ab", binary<OrOp>, [bool]);

        every!(register!(table, OpKey::Compare(CompareKind::Equal), "map_ab", compare<EqualOp>));
        every!(register!(table, OpKey::Compare(CompareKind::NotEqual), "map_ab", compare<NotEqualOp>));
        comparable!(register!(table, OpKey::Compare(CompareKind::Less), "map_ab", compare<LessOp>));
        comparable!(register!(
            table,
            OpKey::Compare(CompareKind::LessOrEqual),
            "map_ab",
            compare<LessOrEqualOp>
        ));
        comparable!(register!(table, OpKey::Compare(CompareKind::Greater), "map_ab", compare<GreaterOp>));
        comparable!(register!(
            table,
            OpKey::Compare(CompareKind::GreaterOrEqual),
            "map_ab",
            compare<GreaterOrEqualOp>
        ));
        floats!(register!(table, OpKey::AlmostEqual, "map_ab", almost_equal));

        every!(register!(table, OpKey::Replace, "map_abc", replace));
        numeric!(register!(table, OpKey::MultiplyAdd, "map_abc", multiply_add));
        register_real_casts!(table, bool, u8, i8, u16, i16, i32, f16, bf16, f32, f64);
        register_casts!(table, Complex32 => [Complex32]);

        every!(register!(table, OpKey::Fill, "map_o", fill));
        every!(register!(table, OpKey::Eye, "map_o", eye));
        comparable!(register!(table, OpKey::FillRange, "map_seq", fill_range));
        floats!(register!(table, OpKey::Random, "map_seq", random));
        floats!(register!(table, OpKey::RandomFromTensors, "map_seq", random_from));

        numeric!(register!(table, OpKey::Reduce(ReduceKind::Sum), "reduce", reduce<SumReducer>));
        numeric!(register!(table, OpKey::Reduce(ReduceKind::Mean), "reduce", reduce<MeanReducer>));
        numeric!(register!(table, OpKey::Reduce(ReduceKind::Prod), "reduce", reduce<ProdReducer>));
        numeric!(register!(
            table,
            OpKey::Reduce(ReduceKind::ProdNonZeros),
            "reduce",
            reduce<ProdNonZerosReducer>
        ));
        comparable!(register!(table, OpKey::Reduce(ReduceKind::Min), "reduce", reduce<MinReducer>));
        comparable!(register!(table, OpKey::Reduce(ReduceKind::Max), "reduce", reduce<MaxReducer>));
        signed!(register!(table, OpKey::Reduce(ReduceKind::AbsSum), "reduce", reduce<AbsSumReducer>));
        register!(table, OpKey::Reduce(ReduceKind::All), "reduce", reduce<AllReducer>, [bool]);
        register!(table, OpKey::Reduce(ReduceKind::Any), "reduce", reduce<AnyReducer>, [bool]);

        Self { entries: table }
    }
}

#[cfg(test)]
mod tests {
    use tg_core::DType;

    use super::{is_supported, kernel_table, registered_kernels};
    use crate::{BinaryKind, OpKey, ReduceKind, UnaryKind};

    #[test]
    fn type_groups_follow_the_op_requirements() {
        let sqrt = OpKey::Unary(UnaryKind::Sqrt);
        assert!(is_supported(sqrt, DType::BF16));
        assert!(!is_supported(sqrt, DType::I32));
        assert!(!is_supported(sqrt, DType::Bool));

        let abs = OpKey::Unary(UnaryKind::Abs);
        assert!(is_supported(abs, DType::I8));
        assert!(!is_supported(abs, DType::U8));

        let add = OpKey::Binary(BinaryKind::Add);
        assert!(is_supported(add, DType::ComplexF32));
        assert!(!is_supported(OpKey::Binary(BinaryKind::Max), DType::ComplexF32));

        assert!(is_supported(OpKey::Reduce(ReduceKind::All), DType::Bool));
        assert!(!is_supported(OpKey::Reduce(ReduceKind::All), DType::F32));
        assert!(!is_supported(add, DType::U64));
    }

    #[test]
    fn casts_never_narrow_complex_to_real() {
        for to in [DType::F32, DType::F64, DType::I32, DType::Bool] {
            assert!(is_supported(OpKey::Cast { to }, DType::F16));
            assert!(!is_supported(OpKey::Cast { to }, DType::ComplexF32));
        }
        assert!(is_supported(
            OpKey::Cast {
                to: DType::ComplexF32
            },
            DType::ComplexF32
        ));
    }

    #[test]
    fn kernel_names_carry_template_and_type() {
        let entry = kernel_table()
            .lookup(OpKey::Unary(UnaryKind::Exp), DType::F16)
            .expect("exp over f16");
        assert_eq!(entry.name, "map_a<f16>");

        let cast = kernel_table()
            .lookup(OpKey::Cast { to: DType::F32 }, DType::I16)
            .expect("i16 to f32");
        assert_eq!(cast.name, "map_a<i16->f32>");

        let kernels = registered_kernels();
        assert!(kernels.windows(2).all(|pair| pair[0].2 <= pair[1].2));
        assert!(kernels.iter().any(|(_, _, name)| *name == "reduce<Complex32>"));
    }
}
