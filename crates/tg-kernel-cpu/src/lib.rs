#![forbid(unsafe_code)]

mod math;
mod ops;
mod random;

use std::fmt;

use rayon::prelude::*;
use tg_core::{Element, TensorDescriptor};
use tg_index::{
    IndexError, IndexKind, IndexStrategy, LaunchConfig, LaunchError, Logical, OperandIndex,
    SequenceIndex, SequenceOperandIndex, TileConfig, ensure_addressable, launch_config,
};

pub use math::{Comparable, Numeric, Real, Signed};
pub use ops::{
    AbsOp, AbsSumReducer, AddOp, AllReducer, AlmostEqualOp, AndOp, AnyReducer, BinaryOp, CeilOp,
    CompareOp, CosOp, DivOp, EqualOp, ExpOp, FloorOp, GreaterOp, GreaterOrEqualOp, LessOp,
    LessOrEqualOp, LogOp, MaxOp, MaxReducer, MeanReducer, MinOp, MinReducer, MulOp, NegOp,
    NotEqualOp, OrOp, PowOp, ProdNonZerosReducer, ProdReducer, Reducer, SigmoidOp, SignOp, SinOp,
    SqrtOp, SquaredOp, SubOp, SumReducer, TanOp, TanhOp, UnaryOp,
};
pub use random::{RandomFill, Sampler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Index(IndexError),
    Launch(LaunchError),
    UnsupportedRank {
        rank: usize,
    },
    ShapeMismatch {
        side: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    MissingOperand {
        index: usize,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    InvalidParameter {
        reason: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(error) => write!(f, "index strategy: {error}"),
            Self::Launch(error) => write!(f, "launch geometry: {error}"),
            Self::UnsupportedRank { rank } => write!(f, "no kernel instantiation for rank {rank}"),
            Self::ShapeMismatch {
                side,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch on {side}: expected={expected:?}, actual={actual:?}"
            ),
            Self::MissingOperand { index } => write!(f, "launch plan has no input #{index}"),
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
            Self::InvalidParameter { reason } => write!(f, "invalid kernel parameter: {reason}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<IndexError> for KernelError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

impl From<LaunchError> for KernelError {
    fn from(value: LaunchError) -> Self {
        Self::Launch(value)
    }
}

/// A descriptor together with the strategy chosen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandPlan {
    pub desc: TensorDescriptor,
    pub kind: IndexKind,
}

impl OperandPlan {
    #[must_use]
    pub fn new(desc: TensorDescriptor, kind: IndexKind) -> Self {
        Self { desc, kind }
    }
}

/// Everything a launcher needs besides the buffers.
///
/// `shape` is the iteration space of the grid: the output shape for
/// elementwise and axis kernels, the input shape for a full reduction,
/// and `[count]` on the flat path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub shape: Vec<usize>,
    pub config: LaunchConfig,
    pub output: OperandPlan,
    pub inputs: Vec<OperandPlan>,
    pub reduced_axes: Vec<usize>,
}

impl LaunchPlan {
    pub fn new(
        shape: Vec<usize>,
        tile: &TileConfig,
        output: OperandPlan,
        inputs: Vec<OperandPlan>,
    ) -> Result<Self, KernelError> {
        ensure_addressable(&output.desc)?;
        for input in &inputs {
            ensure_addressable(&input.desc)?;
        }
        let config = launch_config(&shape, tile)?;
        Ok(Self {
            shape,
            config,
            output,
            inputs,
            reduced_axes: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_reduced_axes(mut self, axes: Vec<usize>) -> Self {
        self.reduced_axes = axes;
        self
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.output.kind == IndexKind::Flat
    }

    pub fn input(&self, index: usize) -> Result<&OperandPlan, KernelError> {
        self.inputs
            .get(index)
            .ok_or(KernelError::MissingOperand { index })
    }
}

/// Read side of an operand: the storage window starting at the view's
/// offset plus the strategy that addresses it.
#[derive(Debug, Clone, Copy)]
pub struct Input<'a, T, I> {
    data: &'a [T],
    index: I,
}

impl<'a, T: Copy, I> Input<'a, T, I> {
    #[must_use]
    pub fn new(data: &'a [T], index: I) -> Self {
        Self { data, index }
    }

    fn load<const R: usize>(&self, position: &Logical<R>) -> T
    where
        I: IndexStrategy<R>,
    {
        self.data[self.index.linear(position) as usize]
    }
}

#[derive(Debug)]
pub struct Output<'a, T, I> {
    data: &'a mut [T],
    index: I,
}

impl<'a, T, I> Output<'a, T, I> {
    #[must_use]
    pub fn new(data: &'a mut [T], index: I) -> Self {
        Self { data, index }
    }
}

fn run_grid<const R: usize, U, F>(config: &LaunchConfig, thread: F) -> Vec<(usize, U)>
where
    U: Send,
    F: Fn(&Logical<R>) -> Option<(usize, U)> + Sync,
{
    (0..config.blocks())
        .into_par_iter()
        .flat_map_iter(|ordinal| {
            config
                .threads_of(config.block_at(ordinal))
                .filter_map(|coord| thread(&Logical::from_grid(&coord)))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn scatter<U>(data: &mut [U], writes: Vec<(usize, U)>) {
    for (offset, value) in writes {
        data[offset] = value;
    }
}

pub fn map_a<const R: usize, A, U, IA, IO, F>(
    config: &LaunchConfig,
    out: Output<'_, U, IO>,
    a: Input<'_, A, IA>,
    f: F,
) where
    A: Element,
    U: Element,
    IA: IndexStrategy<R>,
    IO: IndexStrategy<R>,
    F: Fn(A) -> U + Sync,
{
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        index
            .is_in_bounds(position)
            .then(|| (index.linear(position) as usize, f(a.load(position))))
    });
    scatter(data, writes);
}

pub fn map_ab<const R: usize, A, B, U, IA, IB, IO, F>(
    config: &LaunchConfig,
    out: Output<'_, U, IO>,
    a: Input<'_, A, IA>,
    b: Input<'_, B, IB>,
    f: F,
) where
    A: Element,
    B: Element,
    U: Element,
    IA: IndexStrategy<R>,
    IB: IndexStrategy<R>,
    IO: IndexStrategy<R>,
    F: Fn(A, B) -> U + Sync,
{
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        index.is_in_bounds(position).then(|| {
            (
                index.linear(position) as usize,
                f(a.load(position), b.load(position)),
            )
        })
    });
    scatter(data, writes);
}

pub fn map_abc<const R: usize, A, B, C, U, IA, IB, IC, IO, F>(
    config: &LaunchConfig,
    out: Output<'_, U, IO>,
    a: Input<'_, A, IA>,
    b: Input<'_, B, IB>,
    c: Input<'_, C, IC>,
    f: F,
) where
    A: Element,
    B: Element,
    C: Element,
    U: Element,
    IA: IndexStrategy<R>,
    IB: IndexStrategy<R>,
    IC: IndexStrategy<R>,
    IO: IndexStrategy<R>,
    F: Fn(A, B, C) -> U + Sync,
{
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        index.is_in_bounds(position).then(|| {
            (
                index.linear(position) as usize,
                f(a.load(position), b.load(position), c.load(position)),
            )
        })
    });
    scatter(data, writes);
}

/// Generation from the logical coordinate alone.
pub fn map_o<const R: usize, U, IO, F>(config: &LaunchConfig, out: Output<'_, U, IO>, f: F)
where
    U: Element,
    IO: IndexStrategy<R>,
    F: Fn(&Logical<R>) -> U + Sync,
{
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        index
            .is_in_bounds(position)
            .then(|| (index.linear(position) as usize, f(position)))
    });
    scatter(data, writes);
}

/// Generation from the row-major rank of each output element, so the
/// values do not depend on the output layout.
pub fn map_seq<const R: usize, U, IO, F>(config: &LaunchConfig, out: Output<'_, U, IO>, f: F)
where
    U: Element,
    IO: SequenceIndex<R>,
    F: Fn(u32) -> U + Sync,
{
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        index
            .is_in_bounds(position)
            .then(|| (index.linear(position) as usize, f(index.sequence(position))))
    });
    scatter(data, writes);
}

/// Folds every in-bounds element of `a`: one partial per block, then a
/// parallel tree over the partials.
pub fn reduce_all<const R: usize, T, IA, Red>(
    config: &LaunchConfig,
    a: Input<'_, T, IA>,
    count: usize,
    reducer: Red,
) -> T
where
    T: Element,
    IA: IndexStrategy<R>,
    Red: Reducer<T>,
{
    let acc = (0..config.blocks())
        .into_par_iter()
        .map(|ordinal| {
            config
                .threads_of(config.block_at(ordinal))
                .fold(reducer.identity(), |acc, coord| {
                    let position = Logical::<R>::from_grid(&coord);
                    if a.index.is_in_bounds(&position) {
                        reducer.combine(acc, reducer.map(a.load(&position)))
                    } else {
                        acc
                    }
                })
        })
        .reduce(|| reducer.identity(), |lhs, rhs| reducer.combine(lhs, rhs));
    reducer.finalize(acc, count)
}

/// One thread per output element; `reduced` holds the input extent on
/// reduced axes and 1 elsewhere.
pub fn reduce_axes<const R: usize, T, IA, IO, Red>(
    config: &LaunchConfig,
    out: Output<'_, T, IO>,
    a: Input<'_, T, IA>,
    reduced: [u32; R],
    reducer: Red,
) where
    T: Element,
    IA: IndexStrategy<R>,
    IO: IndexStrategy<R>,
    Red: Reducer<T>,
{
    let folded = reduced
        .iter()
        .fold(1u32, |acc, extent| acc.wrapping_mul(*extent));
    let Output { data, index } = out;
    let writes = run_grid::<R, _, _>(config, |position| {
        if !index.is_in_bounds(position) {
            return None;
        }
        let acc = (0..folded).fold(reducer.identity(), |acc, ordinal| {
            let step = Logical::<R>::from_sequence(ordinal, &reduced);
            let source =
                Logical::<R>::new(std::array::from_fn(|axis| position[axis] + step[axis]));
            reducer.combine(acc, reducer.map(a.load(&source)))
        });
        Some((
            index.linear(position) as usize,
            reducer.finalize(acc, folded as usize),
        ))
    });
    scatter(data, writes);
}

fn window_bounds(
    available: usize,
    desc: &TensorDescriptor,
    side: &'static str,
) -> Result<(usize, usize), KernelError> {
    if desc.span_count() == 0 {
        return Ok((0, 0));
    }
    let needed = desc.required_len();
    if needed > available {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available,
        });
    }
    Ok((desc.storage_offset(), needed))
}

fn window<'a, T>(
    data: &'a [T],
    desc: &TensorDescriptor,
    side: &'static str,
) -> Result<&'a [T], KernelError> {
    let (start, end) = window_bounds(data.len(), desc, side)?;
    Ok(&data[start..end])
}

fn window_mut<'a, T>(
    data: &'a mut [T],
    desc: &TensorDescriptor,
    side: &'static str,
) -> Result<&'a mut [T], KernelError> {
    let (start, end) = window_bounds(data.len(), desc, side)?;
    Ok(&mut data[start..end])
}

fn ensure_covers(
    plan: &LaunchPlan,
    operand: &OperandPlan,
    side: &'static str,
) -> Result<(), KernelError> {
    let shape = operand.desc.shape();
    let flat_view = plan.rank() == 1 && plan.shape.first() == Some(&operand.desc.count());
    if shape == plan.shape.as_slice() || flat_view {
        return Ok(());
    }
    Err(KernelError::ShapeMismatch {
        side,
        expected: plan.shape.clone(),
        actual: shape.to_vec(),
    })
}

fn bind_output<'a, const R: usize, U>(
    plan: &LaunchPlan,
    data: &'a mut [U],
) -> Result<Output<'a, U, OperandIndex<R>>, KernelError> {
    ensure_covers(plan, &plan.output, "out")?;
    let index = OperandIndex::<R>::for_kind(&plan.output.desc, plan.output.kind)?;
    Ok(Output::new(window_mut(data, &plan.output.desc, "out")?, index))
}

fn bind_sequence_output<'a, const R: usize, U>(
    plan: &LaunchPlan,
    data: &'a mut [U],
) -> Result<Output<'a, U, SequenceOperandIndex<R>>, KernelError> {
    ensure_covers(plan, &plan.output, "out")?;
    let index = SequenceOperandIndex::<R>::for_kind(&plan.output.desc, plan.output.kind)?;
    Ok(Output::new(window_mut(data, &plan.output.desc, "out")?, index))
}

const INPUT_SIDES: [&str; 3] = ["a", "b", "c"];

fn bind_input<'a, const R: usize, T: Copy>(
    plan: &LaunchPlan,
    slot: usize,
    data: &'a [T],
) -> Result<Input<'a, T, OperandIndex<R>>, KernelError> {
    let operand = plan.input(slot)?;
    let side = INPUT_SIDES.get(slot).copied().unwrap_or("input");
    ensure_covers(plan, operand, side)?;
    let index = OperandIndex::<R>::for_kind(&operand.desc, operand.kind)?;
    Ok(Input::new(window(data, &operand.desc, side)?, index))
}

macro_rules! by_rank {
    ($rank:expr, $run:ident::<$($generic:ty),*>($($arg:expr),* $(,)?)) => {
        match $rank {
            1 => $run::<1, $($generic),*>($($arg),*),
            2 => $run::<2, $($generic),*>($($arg),*),
            3 => $run::<3, $($generic),*>($($arg),*),
            rank => Err(KernelError::UnsupportedRank { rank }),
        }
    };
}

pub fn launch_a<A, U, F>(plan: &LaunchPlan, out: &mut [U], a: &[A], f: F) -> Result<(), KernelError>
where
    A: Element,
    U: Element,
    F: Fn(A) -> U + Sync,
{
    by_rank!(plan.rank(), launch_a_at::<A, U, F>(plan, out, a, f))
}

fn launch_a_at<const R: usize, A, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    a: &[A],
    f: F,
) -> Result<(), KernelError>
where
    A: Element,
    U: Element,
    F: Fn(A) -> U + Sync,
{
    let out = bind_output::<R, U>(plan, out)?;
    let a = bind_input::<R, A>(plan, 0, a)?;
    map_a::<R, _, _, _, _, _>(&plan.config, out, a, f);
    Ok(())
}

pub fn launch_ab<A, B, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    a: &[A],
    b: &[B],
    f: F,
) -> Result<(), KernelError>
where
    A: Element,
    B: Element,
    U: Element,
    F: Fn(A, B) -> U + Sync,
{
    by_rank!(plan.rank(), launch_ab_at::<A, B, U, F>(plan, out, a, b, f))
}

fn launch_ab_at<const R: usize, A, B, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    a: &[A],
    b: &[B],
    f: F,
) -> Result<(), KernelError>
where
    A: Element,
    B: Element,
    U: Element,
    F: Fn(A, B) -> U + Sync,
{
    let out = bind_output::<R, U>(plan, out)?;
    let a = bind_input::<R, A>(plan, 0, a)?;
    let b = bind_input::<R, B>(plan, 1, b)?;
    map_ab::<R, _, _, _, _, _, _, _>(&plan.config, out, a, b, f);
    Ok(())
}

pub fn launch_abc<A, B, C, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    a: &[A],
    b: &[B],
    c: &[C],
    f: F,
) -> Result<(), KernelError>
where
    A: Element,
    B: Element,
    C: Element,
    U: Element,
    F: Fn(A, B, C) -> U + Sync,
{
    by_rank!(plan.rank(), launch_abc_at::<A, B, C, U, F>(plan, out, a, b, c, f))
}

fn launch_abc_at<const R: usize, A, B, C, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    a: &[A],
    b: &[B],
    c: &[C],
    f: F,
) -> Result<(), KernelError>
where
    A: Element,
    B: Element,
    C: Element,
    U: Element,
    F: Fn(A, B, C) -> U + Sync,
{
    let out = bind_output::<R, U>(plan, out)?;
    let a = bind_input::<R, A>(plan, 0, a)?;
    let b = bind_input::<R, B>(plan, 1, b)?;
    let c = bind_input::<R, C>(plan, 2, c)?;
    map_abc::<R, _, _, _, _, _, _, _, _, _>(&plan.config, out, a, b, c, f);
    Ok(())
}

/// Positional generation; `f` receives the logical coordinate.
pub fn launch_o<U, F>(plan: &LaunchPlan, out: &mut [U], f: F) -> Result<(), KernelError>
where
    U: Element,
    F: Fn(&[u32]) -> U + Sync,
{
    by_rank!(plan.rank(), launch_o_at::<U, F>(plan, out, f))
}

fn launch_o_at<const R: usize, U, F>(plan: &LaunchPlan, out: &mut [U], f: F) -> Result<(), KernelError>
where
    U: Element,
    F: Fn(&[u32]) -> U + Sync,
{
    let out = bind_output::<R, U>(plan, out)?;
    map_o::<R, _, _, _>(&plan.config, out, |position: &Logical<R>| {
        f(&position.coords()[..])
    });
    Ok(())
}

pub fn launch_seq<U, F>(plan: &LaunchPlan, out: &mut [U], f: F) -> Result<(), KernelError>
where
    U: Element,
    F: Fn(u32) -> U + Sync,
{
    by_rank!(plan.rank(), launch_seq_at::<U, F>(plan, out, f))
}

fn launch_seq_at<const R: usize, U, F>(
    plan: &LaunchPlan,
    out: &mut [U],
    f: F,
) -> Result<(), KernelError>
where
    U: Element,
    F: Fn(u32) -> U + Sync,
{
    let out = bind_sequence_output::<R, U>(plan, out)?;
    map_seq::<R, _, _, _>(&plan.config, out, f);
    Ok(())
}

/// Full reduction into the single element of the output view.
pub fn launch_reduce_all<T, Red>(
    plan: &LaunchPlan,
    out: &mut [T],
    a: &[T],
    reducer: Red,
) -> Result<(), KernelError>
where
    T: Element,
    Red: Reducer<T>,
{
    by_rank!(plan.rank(), launch_reduce_all_at::<T, Red>(plan, out, a, reducer))
}

fn launch_reduce_all_at<const R: usize, T, Red>(
    plan: &LaunchPlan,
    out: &mut [T],
    a: &[T],
    reducer: Red,
) -> Result<(), KernelError>
where
    T: Element,
    Red: Reducer<T>,
{
    let count = plan.input(0)?.desc.count();
    let a = bind_input::<R, T>(plan, 0, a)?;
    let value = reduce_all::<R, _, _, _>(&plan.config, a, count, reducer);
    let out = window_mut(out, &plan.output.desc, "out")?;
    if let Some(slot) = out.first_mut() {
        *slot = value;
    }
    Ok(())
}

/// Axis reduction with kept dimensions over `plan.reduced_axes`.
pub fn launch_reduce_axes<T, Red>(
    plan: &LaunchPlan,
    out: &mut [T],
    a: &[T],
    reducer: Red,
) -> Result<(), KernelError>
where
    T: Element,
    Red: Reducer<T>,
{
    by_rank!(plan.rank(), launch_reduce_axes_at::<T, Red>(plan, out, a, reducer))
}

fn launch_reduce_axes_at<const R: usize, T, Red>(
    plan: &LaunchPlan,
    out: &mut [T],
    a: &[T],
    reducer: Red,
) -> Result<(), KernelError>
where
    T: Element,
    Red: Reducer<T>,
{
    let operand = plan.input(0)?;
    let input_shape = operand.desc.shape();
    let kept = |axis: usize| !plan.reduced_axes.contains(&axis);
    let consistent = input_shape.len() == R
        && (0..R).all(|axis| {
            let expected = if kept(axis) { input_shape[axis] } else { 1 };
            plan.shape[axis] == expected
        });
    if !consistent {
        return Err(KernelError::ShapeMismatch {
            side: "a",
            expected: plan.shape.clone(),
            actual: input_shape.to_vec(),
        });
    }

    let mut reduced = [1u32; R];
    let mut folded = 1usize;
    for axis in plan.reduced_axes.iter().copied().filter(|axis| *axis < R) {
        let extent = input_shape[axis];
        reduced[axis] =
            u32::try_from(extent).map_err(|_| IndexError::DimensionOverflow { value: extent })?;
        folded = folded.saturating_mul(extent);
    }
    u32::try_from(folded).map_err(|_| IndexError::DimensionOverflow { value: folded })?;

    let out = bind_output::<R, T>(plan, out)?;
    let index = OperandIndex::<R>::for_kind(&operand.desc, operand.kind)?;
    let a = Input::new(window(a, &operand.desc, "a")?, index);
    reduce_axes::<R, _, _, _, _>(&plan.config, out, a, reduced, reducer);
    Ok(())
}
