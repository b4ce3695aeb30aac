use std::fmt;

use tg_core::{DType, Scalar, Storage, TensorDescriptor};
use tg_index::{MAX_RANK, select_index_kind};
use tg_kernel_cpu::{KernelError, LaunchPlan, OperandPlan, Sampler};
use tg_runtime::{BufferError, DeviceBuffer, DeviceQueue, TaskError};

use crate::table::{KernelEntry, kernel_table};
use crate::{DispatchDecision, DispatchError, OpKey, Operand, Params, ReduceKind, TensorArg};

/// When an elementwise launch may collapse to one flat axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlatRule {
    /// Output and every non-single input share one dense layout.
    SharedLayout,
    /// Any dense output; positions are not observed.
    Dense,
    /// Dense row-major output, so the flat position is the logical
    /// sequence.
    RowMajor,
    Never,
}

/// One elementwise or generation launch, validated in phases: element
/// types, then ranks, then arguments.
pub(crate) struct Request<'a> {
    op: OpKey,
    dtype: DType,
    output: TensorArg<'a>,
    output_dtype: DType,
    operands: Vec<(&'static str, Operand<'a>, DType)>,
    params: Params,
    flat_rule: FlatRule,
    needs_sequence: bool,
    required_rank: Option<usize>,
    scalars: Vec<Scalar>,
    violation: Option<&'static str>,
}

impl<'a> Request<'a> {
    pub(crate) fn new(op: OpKey, dtype: DType, output: TensorArg<'a>, output_dtype: DType) -> Self {
        Self {
            op,
            dtype,
            output,
            output_dtype,
            operands: Vec::new(),
            params: Params::None,
            flat_rule: FlatRule::SharedLayout,
            needs_sequence: false,
            required_rank: None,
            scalars: Vec::new(),
            violation: None,
        }
    }

    pub(crate) fn operand(mut self, role: &'static str, operand: Operand<'a>, dtype: DType) -> Self {
        self.operands.push((role, operand, dtype));
        self
    }

    pub(crate) fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub(crate) fn generation(mut self, flat_rule: FlatRule, needs_sequence: bool) -> Self {
        self.flat_rule = flat_rule;
        self.needs_sequence = needs_sequence;
        self
    }

    pub(crate) fn required_rank(mut self, rank: usize) -> Self {
        self.required_rank = Some(rank);
        self
    }

    /// Scalars that must convert to the kernel element type.
    pub(crate) fn representable(mut self, values: &[Scalar]) -> Self {
        self.scalars.extend_from_slice(values);
        self
    }

    pub(crate) fn check(mut self, holds: bool, reason: &'static str) -> Self {
        if !holds && self.violation.is_none() {
            self.violation = Some(reason);
        }
        self
    }

    pub(crate) fn submit(self, queue: &DeviceQueue) -> Result<DispatchDecision, DispatchError> {
        let op = self.op;

        let entry = lookup(op, self.dtype)?;
        expect_dtype(op, self.output.desc.dtype(), self.output_dtype)?;
        for (_, operand, dtype) in &self.operands {
            if let Some(actual) = operand.dtype() {
                expect_dtype(op, actual, *dtype)?;
            }
        }

        let rank = self.output.desc.rank();
        check_rank(op, rank)?;
        for (_, operand, _) in &self.operands {
            if let Operand::Tensor(arg) = operand {
                check_rank(op, arg.desc.rank())?;
            }
        }
        if self.required_rank.is_some_and(|required| required != rank) {
            return Err(DispatchError::UnsupportedRank { op, rank });
        }

        if let Some(reason) = self.violation {
            return Err(invalid(op, reason));
        }
        for value in &self.scalars {
            Storage::splat(self.dtype, *value, 1).map_err(|err| invalid(op, err.to_string()))?;
        }
        if let Params::Random { fill, seed } = self.params {
            Sampler::new(fill, seed).map_err(|err| invalid(op, err.to_string()))?;
        }
        check_output(op, self.output)?;

        let out_desc = self.output.desc.rank1();
        let inputs = self
            .operands
            .iter()
            .map(|(role, operand, dtype)| bind(op, *role, *operand, *dtype, out_desc.shape()))
            .collect::<Result<Vec<_>, _>>()?;

        let flat = match self.flat_rule {
            FlatRule::SharedLayout => {
                out_desc.is_dense()
                    && inputs.iter().all(|input| {
                        input.desc.is_single()
                            || (input.desc.is_dense() && same_layout(&input.desc, &out_desc))
                    })
            }
            FlatRule::Dense => out_desc.is_dense(),
            FlatRule::RowMajor => out_desc.is_dense() && out_desc.is_contiguous(),
            FlatRule::Never => false,
        };

        let out_kind = select_index_kind(&out_desc, flat, self.needs_sequence);
        let mut index = vec![("out", out_kind)];
        let mut operand_plans = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let kind = select_index_kind(&input.desc, flat, false);
            index.push((input.role, kind));
            operand_plans.push(OperandPlan::new(input.desc.clone(), kind));
        }

        let shape = if flat {
            vec![out_desc.count()]
        } else {
            out_desc.shape().to_vec()
        };
        let count = out_desc.count();
        let plan = LaunchPlan::new(
            shape,
            queue.tile(),
            OperandPlan::new(out_desc, out_kind),
            operand_plans,
        )
        .map_err(|err| launch_failure(op, &err))?;

        let decision = DispatchDecision {
            op,
            dtype: self.dtype,
            kernel: entry.name,
            rank: plan.rank(),
            flat,
            index,
            launch: plan.config,
        };
        if count > 0 {
            let sources = inputs.into_iter().map(|input| input.source).collect();
            enqueue(queue, op, entry, plan, self.params, self.output.buffer, sources)?;
        }
        Ok(decision)
    }
}

pub(crate) fn submit_reduction(
    queue: &DeviceQueue,
    kind: ReduceKind,
    input: TensorArg<'_>,
    axes: &[usize],
    out: TensorArg<'_>,
) -> Result<DispatchDecision, DispatchError> {
    let op = OpKey::Reduce(kind);
    let dtype = input.desc.dtype();

    let entry = lookup(op, dtype)?;
    expect_dtype(op, out.desc.dtype(), dtype)?;

    let rank = input.desc.rank();
    check_rank(op, rank)?;
    check_rank(op, out.desc.rank())?;
    if !axes.is_empty() && rank == 0 {
        return Err(DispatchError::UnsupportedRank { op, rank });
    }

    check_tensor(op, "a", input)?;
    check_output(op, out)?;

    let (plan, flat, index) = if axes.is_empty() {
        if out.desc.count() != 1 {
            return Err(invalid(
                op,
                format!(
                    "a full reduction writes one element, output view has {}",
                    out.desc.count()
                ),
            ));
        }
        let source = input.desc.rank1();
        let flat = source.is_dense();
        let in_kind = select_index_kind(&source, flat, false);
        let shape = if flat {
            vec![source.count()]
        } else {
            source.shape().to_vec()
        };
        let out_desc = out.desc.rank1();
        let out_kind = select_index_kind(&out_desc, false, false);
        let plan = LaunchPlan::new(
            shape,
            queue.tile(),
            OperandPlan::new(out_desc, out_kind),
            vec![OperandPlan::new(source, in_kind)],
        )
        .map_err(|err| launch_failure(op, &err))?;
        (plan, flat, vec![("out", out_kind), ("a", in_kind)])
    } else {
        let mut reduced = axes.to_vec();
        reduced.sort_unstable();
        reduced.dedup();
        if reduced.len() != axes.len() || reduced.iter().any(|&axis| axis >= rank) {
            return Err(invalid(
                op,
                format!("axes {axes:?} must be distinct and below rank {rank}"),
            ));
        }
        let kept_shape = input
            .desc
            .shape()
            .iter()
            .enumerate()
            .map(|(axis, &extent)| if reduced.contains(&axis) { 1 } else { extent })
            .collect::<Vec<_>>();
        if out.desc.shape() != kept_shape.as_slice() {
            return Err(invalid(
                op,
                format!(
                    "output shape {:?} must be {kept_shape:?} with reduced axes kept",
                    out.desc.shape()
                ),
            ));
        }
        let out_kind = select_index_kind(out.desc, false, false);
        let in_kind = select_index_kind(input.desc, false, false);
        let plan = LaunchPlan::new(
            kept_shape,
            queue.tile(),
            OperandPlan::new(out.desc.clone(), out_kind),
            vec![OperandPlan::new(input.desc.clone(), in_kind)],
        )
        .map_err(|err| launch_failure(op, &err))?
        .with_reduced_axes(reduced);
        (plan, false, vec![("out", out_kind), ("a", in_kind)])
    };

    let decision = DispatchDecision {
        op,
        dtype,
        kernel: entry.name,
        rank: plan.rank(),
        flat,
        index,
        launch: plan.config,
    };
    if out.desc.count() > 0 {
        let sources = vec![Source::Shared(input.buffer.clone())];
        enqueue(queue, op, entry, plan, Params::None, out.buffer, sources)?;
    }
    Ok(decision)
}

/// Same element offsets for every position; axes of extent 1 never move.
fn same_layout(a: &TensorDescriptor, b: &TensorDescriptor) -> bool {
    a.shape() == b.shape()
        && a
            .shape()
            .iter()
            .zip(a.strides().iter().zip(b.strides()))
            .all(|(&extent, (lhs, rhs))| extent == 1 || lhs == rhs)
}

fn lookup(op: OpKey, dtype: DType) -> Result<KernelEntry, DispatchError> {
    kernel_table()
        .lookup(op, dtype)
        .ok_or(DispatchError::UnsupportedType { op, dtype })
}

fn expect_dtype(op: OpKey, actual: DType, expected: DType) -> Result<(), DispatchError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DispatchError::UnsupportedType { op, dtype: actual })
    }
}

fn check_rank(op: OpKey, rank: usize) -> Result<(), DispatchError> {
    if rank > MAX_RANK {
        return Err(DispatchError::UnsupportedRank { op, rank });
    }
    Ok(())
}

fn invalid(op: OpKey, reason: impl Into<String>) -> DispatchError {
    DispatchError::InvalidArgument {
        op,
        reason: reason.into(),
    }
}

fn launch_failure(op: OpKey, error: &KernelError) -> DispatchError {
    DispatchError::LaunchFailure {
        op,
        reason: error.to_string(),
    }
}

fn check_tensor(op: OpKey, role: &str, arg: TensorArg<'_>) -> Result<(), DispatchError> {
    if arg.buffer.dtype() != arg.desc.dtype() {
        return Err(invalid(
            op,
            format!(
                "{role} buffer holds {} elements but the view reads {}",
                arg.buffer.dtype(),
                arg.desc.dtype()
            ),
        ));
    }
    let needed = arg.desc.required_len();
    if arg.buffer.len() < needed {
        return Err(invalid(
            op,
            format!(
                "{role} view needs {needed} elements, buffer has {}",
                arg.buffer.len()
            ),
        ));
    }
    Ok(())
}

fn check_output(op: OpKey, out: TensorArg<'_>) -> Result<(), DispatchError> {
    check_tensor(op, "out", out)?;
    if out.desc.has_broadcast_axis() {
        return Err(invalid(op, "output view repeats elements through a zero stride"));
    }
    Ok(())
}

/// Where a kernel input lives once the call returns.
pub(crate) enum Source {
    Shared(DeviceBuffer),
    Owned(Storage),
}

impl Source {
    fn buffer(&self) -> Option<&DeviceBuffer> {
        match self {
            Source::Shared(buffer) => Some(buffer),
            Source::Owned(_) => None,
        }
    }
}

struct Bound {
    role: &'static str,
    desc: TensorDescriptor,
    source: Source,
}

fn bind(
    op: OpKey,
    role: &'static str,
    operand: Operand<'_>,
    dtype: DType,
    target: &[usize],
) -> Result<Bound, DispatchError> {
    let (desc, source) = match operand {
        Operand::Tensor(arg) => {
            check_tensor(op, role, arg)?;
            (arg.desc.clone(), Source::Shared(arg.buffer.clone()))
        }
        Operand::Element(value) => {
            let storage = Storage::splat(dtype, value, 1)
                .map_err(|err| invalid(op, format!("{role}: {err}")))?;
            (TensorDescriptor::scalar(dtype), Source::Owned(storage))
        }
    };
    let desc = desc
        .broadcast_to(target)
        .map_err(|err| invalid(op, format!("{role}: {err}")))?;
    Ok(Bound { role, desc, source })
}

fn enqueue(
    queue: &DeviceQueue,
    op: OpKey,
    entry: KernelEntry,
    plan: LaunchPlan,
    params: Params,
    output: &DeviceBuffer,
    sources: Vec<Source>,
) -> Result<(), DispatchError> {
    let label = format!("{op} {}", entry.name);
    let task_label = label.clone();
    let output = output.clone();
    queue
        .enqueue(label, move || {
            execute(entry, &plan, &params, &output, &sources)
                .map_err(|fault| TaskError::new(task_label, fault.to_string()))
        })
        .map_err(|err| DispatchError::LaunchFailure {
            op,
            reason: err.to_string(),
        })
}

#[derive(Debug)]
enum LaunchFault {
    Buffer(BufferError),
    Kernel(KernelError),
    Unlocked { id: u64 },
}

impl fmt::Display for LaunchFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(error) => write!(f, "{error}"),
            Self::Kernel(error) => write!(f, "{error}"),
            Self::Unlocked { id } => write!(f, "buffer {id} was not locked for the launch"),
        }
    }
}

impl From<BufferError> for LaunchFault {
    fn from(value: BufferError) -> Self {
        Self::Buffer(value)
    }
}

impl From<KernelError> for LaunchFault {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// Locks every distinct buffer in ascending id order, the output for
/// writing. Inputs aliasing the output read a snapshot taken under the
/// write lock.
fn execute(
    entry: KernelEntry,
    plan: &LaunchPlan,
    params: &Params,
    output: &DeviceBuffer,
    sources: &[Source],
) -> Result<(), LaunchFault> {
    let mut others = sources
        .iter()
        .filter_map(Source::buffer)
        .filter(|buffer| buffer.id() != output.id())
        .collect::<Vec<_>>();
    others.sort_unstable_by_key(|buffer| buffer.id());
    others.dedup_by_key(|buffer| buffer.id());

    let mut target = None;
    let mut reads = Vec::with_capacity(others.len());
    for buffer in others {
        if target.is_none() && output.id() < buffer.id() {
            target = Some(output.write()?);
        }
        reads.push((buffer.id(), buffer.read()?));
    }
    let mut target = match target {
        Some(guard) => guard,
        None => output.write()?,
    };

    let aliased = sources
        .iter()
        .filter_map(Source::buffer)
        .any(|buffer| buffer.id() == output.id());
    let snapshot = aliased.then(|| (*target).clone());

    let mut views: Vec<&Storage> = Vec::with_capacity(sources.len());
    for source in sources {
        let view = match source {
            Source::Owned(storage) => storage,
            Source::Shared(buffer) if buffer.id() == output.id() => snapshot
                .as_ref()
                .ok_or(LaunchFault::Unlocked { id: buffer.id() })?,
            Source::Shared(buffer) => reads
                .iter()
                .find(|(id, _)| *id == buffer.id())
                .map(|(_, guard)| &**guard)
                .ok_or(LaunchFault::Unlocked { id: buffer.id() })?,
        };
        views.push(view);
    }

    (entry.launcher)(plan, params, &mut *target, &views)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tg_core::{DType, TensorDescriptor};
    use tg_runtime::{DeviceBuffer, DeviceQueue, QueueMode};

    use crate::{BinaryKind, TensorArg, binary};

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn values(seed: u64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|index| (det_seed(&[seed, index as u64]) % 1000) as f64 / 10.0)
            .collect()
    }

    proptest! {
        #[test]
        fn layouts_do_not_change_elementwise_results(
            rows in 1usize..6,
            cols in 1usize..6,
            seed in any::<u64>(),
        ) {
            let queue = DeviceQueue::with_mode(QueueMode::Sync).expect("sync queue");
            let count = rows * cols;
            let lhs = values(seed, count);
            let rhs = values(seed ^ 0x5a5a, count);

            let row = TensorDescriptor::dense(DType::F64, vec![rows, cols]);
            let column = TensorDescriptor::column_major(DType::F64, vec![rows, cols]);
            let mut rhs_column = vec![0.0; count];
            for r in 0..rows {
                for c in 0..cols {
                    rhs_column[c * rows + r] = rhs[r * cols + c];
                }
            }

            let lhs_buffer = DeviceBuffer::from_vec(lhs.clone());
            let rhs_buffer = DeviceBuffer::from_vec(rhs_column);
            let out = DeviceBuffer::zeros(DType::F64, count).expect("zeros");
            let decision = binary(
                &queue,
                BinaryKind::Mul,
                TensorArg::new(&row, &lhs_buffer).into(),
                TensorArg::new(&column, &rhs_buffer).into(),
                TensorArg::new(&row, &out),
            )
            .expect("mul dispatches");
            queue.synchronize().expect("mul runs");

            let expected = lhs.iter().zip(&rhs).map(|(a, b)| a * b).collect::<Vec<_>>();
            prop_assert_eq!(out.to_vec::<f64>().expect("read"), expected);
            prop_assert_eq!(decision.flat, rows == 1 || cols == 1);
        }
    }
}
