#![forbid(unsafe_code)]

mod plan;
mod table;

use std::fmt;

use tg_core::{DType, Scalar, TensorDescriptor};
use tg_index::{IndexKind, LaunchConfig};
use tg_kernel_cpu::RandomFill;
use tg_runtime::{DeviceBuffer, DeviceQueue};

use plan::{FlatRule, Request};

pub use table::{is_supported, registered_kernels};

macro_rules! op_kinds {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

op_kinds!(UnaryKind {
    Abs => "abs",
    Neg => "neg",
    Sign => "sign",
    Squared => "squared",
    Sqrt => "sqrt",
    Exp => "exp",
    Log => "log",
    Sin => "sin",
    Cos => "cos",
    Tan => "tan",
    Tanh => "tanh",
    Sigmoid => "sigmoid",
    Floor => "floor",
    Ceil => "ceil",
});

op_kinds!(BinaryKind {
    Add => "add",
    Sub => "sub",
    Mul => "mul",
    Div => "div",
    Min => "min",
    Max => "max",
    Pow => "pow",
});

op_kinds!(CompareKind {
    Equal => "equal",
    NotEqual => "not_equal",
    Less => "less",
    LessOrEqual => "less_or_equal",
    Greater => "greater",
    GreaterOrEqual => "greater_or_equal",
});

op_kinds!(LogicalKind {
    And => "and",
    Or => "or",
});

op_kinds!(ReduceKind {
    Sum => "sum",
    Mean => "mean",
    Prod => "prod",
    ProdNonZeros => "prod_non_zeros",
    Min => "min",
    Max => "max",
    AbsSum => "abs_sum",
    All => "all",
    Any => "any",
});

/// Operation half of a kernel-table key; the other half is the element
/// type the kernel is instantiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKey {
    Unary(UnaryKind),
    Binary(BinaryKind),
    Compare(CompareKind),
    Logical(LogicalKind),
    AlmostEqual,
    Replace,
    MultiplyAdd,
    Cast { to: DType },
    Fill,
    FillRange,
    Eye,
    Random,
    /// Normal fills whose mean and std live in one-element tensors.
    RandomFromTensors,
    Reduce(ReduceKind),
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary(kind) => write!(f, "{kind}"),
            Self::Binary(kind) => write!(f, "{kind}"),
            Self::Compare(kind) => write!(f, "{kind}"),
            Self::Logical(kind) => write!(f, "{kind}"),
            Self::AlmostEqual => f.write_str("elements_almost_equal"),
            Self::Replace => f.write_str("replace"),
            Self::MultiplyAdd => f.write_str("multiply_add"),
            Self::Cast { to } => write!(f, "copy_to_{to}"),
            Self::Fill => f.write_str("fill"),
            Self::FillRange => f.write_str("fill_range"),
            Self::Eye => f.write_str("eye"),
            Self::Random => f.write_str("fill_random"),
            Self::RandomFromTensors => f.write_str("fill_random_from_tensors"),
            Self::Reduce(kind) => write!(f, "reduce_{kind}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DispatchStatus {
    Success = 0,
    UnsupportedType = 1,
    UnsupportedRank = 2,
    InvalidArgument = 3,
    LaunchFailure = 4,
}

impl DispatchStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn of<T>(result: &Result<T, DispatchError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(error) => error.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    UnsupportedType { op: OpKey, dtype: DType },
    UnsupportedRank { op: OpKey, rank: usize },
    InvalidArgument { op: OpKey, reason: String },
    LaunchFailure { op: OpKey, reason: String },
}

impl DispatchError {
    #[must_use]
    pub fn status(&self) -> DispatchStatus {
        match self {
            Self::UnsupportedType { .. } => DispatchStatus::UnsupportedType,
            Self::UnsupportedRank { .. } => DispatchStatus::UnsupportedRank,
            Self::InvalidArgument { .. } => DispatchStatus::InvalidArgument,
            Self::LaunchFailure { .. } => DispatchStatus::LaunchFailure,
        }
    }

    #[must_use]
    pub fn op(&self) -> OpKey {
        match self {
            Self::UnsupportedType { op, .. }
            | Self::UnsupportedRank { op, .. }
            | Self::InvalidArgument { op, .. }
            | Self::LaunchFailure { op, .. } => *op,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType { op, dtype } => {
                write!(f, "{op} has no kernel for element type {dtype}")
            }
            Self::UnsupportedRank { op, rank } => write!(f, "{op} does not support rank {rank}"),
            Self::InvalidArgument { op, reason } => write!(f, "{op} invalid argument: {reason}"),
            Self::LaunchFailure { op, reason } => write!(f, "{op} launch failure: {reason}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// What was launched for one successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: OpKey,
    pub dtype: DType,
    pub kernel: &'static str,
    pub rank: usize,
    pub flat: bool,
    /// Strategy per operand, output first.
    pub index: Vec<(&'static str, IndexKind)>,
    pub launch: LaunchConfig,
}

impl fmt::Display for DispatchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self
            .index
            .iter()
            .map(|(role, kind)| format!("{role}:{kind}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "op={} dtype={} kernel={} rank={} flat={} index={} grid={} block={}",
            self.op,
            self.dtype,
            self.kernel,
            self.rank,
            self.flat,
            index,
            self.launch.grid,
            self.launch.block
        )
    }
}

/// A tensor view over a device buffer.
#[derive(Debug, Clone, Copy)]
pub struct TensorArg<'a> {
    pub desc: &'a TensorDescriptor,
    pub buffer: &'a DeviceBuffer,
}

impl<'a> TensorArg<'a> {
    #[must_use]
    pub fn new(desc: &'a TensorDescriptor, buffer: &'a DeviceBuffer) -> Self {
        Self { desc, buffer }
    }
}

/// Either a tensor or a single value broadcast over the output.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Tensor(TensorArg<'a>),
    Element(Scalar),
}

impl Operand<'_> {
    fn dtype(&self) -> Option<DType> {
        match self {
            Operand::Tensor(arg) => Some(arg.desc.dtype()),
            Operand::Element(_) => None,
        }
    }
}

impl<'a> From<TensorArg<'a>> for Operand<'a> {
    fn from(value: TensorArg<'a>) -> Self {
        Operand::Tensor(value)
    }
}

impl From<Scalar> for Operand<'_> {
    fn from(value: Scalar) -> Self {
        Operand::Element(value)
    }
}

/// Scalar parameters forwarded to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Params {
    None,
    Fill(Scalar),
    Range { first: Scalar, last: Scalar, step: Scalar },
    Eye { offset: i64 },
    Random { fill: RandomFill, seed: u64 },
    RandomFrom { truncated: bool, seed: u64 },
    Tolerance(f64),
}

pub fn unary(
    queue: &DeviceQueue,
    op: UnaryKind,
    a: TensorArg<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = a.desc.dtype();
    Request::new(OpKey::Unary(op), dtype, out, dtype)
        .operand("a", a.into(), dtype)
        .submit(queue)
}

/// Elementwise `lhs op rhs`; either side may be a single element but not
/// both.
pub fn binary(
    queue: &DeviceQueue,
    op: BinaryKind,
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let key = OpKey::Binary(op);
    let dtype = lhs
        .dtype()
        .or(rhs.dtype())
        .ok_or_else(|| DispatchError::InvalidArgument {
            op: key,
            reason: "at least one operand must be a tensor".to_string(),
        })?;
    Request::new(key, dtype, out, dtype)
        .operand("a", lhs, dtype)
        .operand("b", rhs, dtype)
        .submit(queue)
}

pub fn compare(
    queue: &DeviceQueue,
    op: CompareKind,
    lhs: TensorArg<'_>,
    rhs: Operand<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = lhs.desc.dtype();
    Request::new(OpKey::Compare(op), dtype, out, DType::Bool)
        .operand("a", lhs.into(), dtype)
        .operand("b", rhs, dtype)
        .submit(queue)
}

pub fn logical(
    queue: &DeviceQueue,
    op: LogicalKind,
    lhs: TensorArg<'_>,
    rhs: TensorArg<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = lhs.desc.dtype();
    Request::new(OpKey::Logical(op), dtype, out, DType::Bool)
        .operand("a", lhs.into(), DType::Bool)
        .operand("b", rhs.into(), DType::Bool)
        .submit(queue)
}

/// `|a - b| <= tolerance` per element.
pub fn elements_almost_equal(
    queue: &DeviceQueue,
    a: TensorArg<'_>,
    b: TensorArg<'_>,
    tolerance: f64,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let key = OpKey::AlmostEqual;
    let dtype = a.desc.dtype();
    Request::new(key, dtype, out, DType::Bool)
        .operand("a", a.into(), dtype)
        .operand("b", b.into(), dtype)
        .params(Params::Tolerance(tolerance))
        .check(tolerance >= 0.0, "tolerance must be a non-negative number")
        .submit(queue)
}

/// `condition ? y : x` per element.
pub fn replace(
    queue: &DeviceQueue,
    x: TensorArg<'_>,
    y: Operand<'_>,
    condition: TensorArg<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = x.desc.dtype();
    Request::new(OpKey::Replace, dtype, out, dtype)
        .operand("x", x.into(), dtype)
        .operand("y", y, dtype)
        .operand("cond", condition.into(), DType::Bool)
        .submit(queue)
}

/// `a * b + c` per element.
pub fn multiply_add(
    queue: &DeviceQueue,
    a: TensorArg<'_>,
    b: TensorArg<'_>,
    c: Operand<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = a.desc.dtype();
    Request::new(OpKey::MultiplyAdd, dtype, out, dtype)
        .operand("a", a.into(), dtype)
        .operand("b", b.into(), dtype)
        .operand("c", c, dtype)
        .submit(queue)
}

/// Reorders `src` into the layout of `out`, converting the element type
/// on the way.
pub fn copy(
    queue: &DeviceQueue,
    src: TensorArg<'_>,
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = src.desc.dtype();
    let to = out.desc.dtype();
    Request::new(OpKey::Cast { to }, dtype, out, to)
        .operand("a", src.into(), dtype)
        .submit(queue)
}

pub fn fill(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    value: Scalar,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = out.desc.dtype();
    Request::new(OpKey::Fill, dtype, out, dtype)
        .generation(FlatRule::Dense, false)
        .params(Params::Fill(value))
        .representable(&[value])
        .submit(queue)
}

/// `first + sequence * step`, clamped so it never passes `last`.
pub fn fill_range(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    first: Scalar,
    last: Scalar,
    step: Scalar,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = out.desc.dtype();
    Request::new(OpKey::FillRange, dtype, out, dtype)
        .generation(FlatRule::RowMajor, true)
        .params(Params::Range { first, last, step })
        .representable(&[first, last, step])
        .submit(queue)
}

/// Ones where `col - row == offset`, zeros elsewhere.
pub fn eye(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    offset: i64,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = out.desc.dtype();
    Request::new(OpKey::Eye, dtype, out, dtype)
        .generation(FlatRule::Never, false)
        .required_rank(2)
        .params(Params::Eye { offset })
        .submit(queue)
}

pub fn fill_random_uniform(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    lower: f64,
    upper: f64,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    fill_random(queue, out, RandomFill::Uniform { lower, upper }, seed)
}

pub fn fill_random_normal(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    mean: f64,
    std: f64,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    fill_random(queue, out, RandomFill::Normal { mean, std }, seed)
}

/// Normal samples restricted to `mean ± 2·std`.
pub fn fill_random_truncated_normal(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    mean: f64,
    std: f64,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    fill_random(queue, out, RandomFill::TruncatedNormal { mean, std }, seed)
}

fn fill_random(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    fill: RandomFill,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = out.desc.dtype();
    Request::new(OpKey::Random, dtype, out, dtype)
        .generation(FlatRule::RowMajor, true)
        .params(Params::Random { fill, seed })
        .submit(queue)
}

/// Like [`fill_random_normal`], with `mean` and `std` read from
/// one-element tensors when the kernel runs, so earlier work on the queue
/// may produce them.
pub fn fill_random_normal_from(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    mean: TensorArg<'_>,
    std: TensorArg<'_>,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    fill_random_from(queue, out, mean, std, false, seed)
}

pub fn fill_random_truncated_normal_from(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    mean: TensorArg<'_>,
    std: TensorArg<'_>,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    fill_random_from(queue, out, mean, std, true, seed)
}

fn fill_random_from(
    queue: &DeviceQueue,
    out: TensorArg<'_>,
    mean: TensorArg<'_>,
    std: TensorArg<'_>,
    truncated: bool,
    seed: u64,
) -> Result<DispatchDecision, DispatchError> {
    let dtype = out.desc.dtype();
    let element_of = |arg: TensorArg<'_>| {
        TensorDescriptor::scalar(arg.desc.dtype()).with_storage_offset(arg.desc.storage_offset())
    };
    let (mean_desc, std_desc) = (element_of(mean), element_of(std));
    Request::new(OpKey::RandomFromTensors, dtype, out, dtype)
        .generation(FlatRule::RowMajor, true)
        .operand("mean", TensorArg::new(&mean_desc, mean.buffer).into(), dtype)
        .operand("std", TensorArg::new(&std_desc, std.buffer).into(), dtype)
        .check(
            mean.desc.count() == 1 && std.desc.count() == 1,
            "mean and std must be one-element tensors",
        )
        .params(Params::RandomFrom { truncated, seed })
        .submit(queue)
}

/// Reduces `input` over `axes` into `out`. An empty axis list reduces
/// everything into a one-element output; otherwise `out` keeps the input
/// rank with extent 1 on every reduced axis.
pub fn reduce(
    queue: &DeviceQueue,
    op: ReduceKind,
    input: TensorArg<'_>,
    axes: &[usize],
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    plan::submit_reduction(queue, op, input, axes, out)
}
