#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};

pub use half::{bf16, f16};
pub use num_complex::Complex32;

/// Element type tag. Bit width and signedness live in the tag itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    ComplexF16,
    ComplexBF16,
    ComplexF32,
    ComplexF64,
    I4,
    U4,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Bool,
}

impl DType {
    #[must_use]
    pub const fn all() -> &'static [DType] {
        &[
            DType::F16,
            DType::BF16,
            DType::F32,
            DType::F64,
            DType::ComplexF16,
            DType::ComplexBF16,
            DType::ComplexF32,
            DType::ComplexF64,
            DType::I4,
            DType::U4,
            DType::I8,
            DType::U8,
            DType::I16,
            DType::U16,
            DType::I32,
            DType::U32,
            DType::I64,
            DType::U64,
            DType::Bool,
        ]
    }

    /// Wire value used by the C boundary (CUDA data-type numbering).
    #[must_use]
    pub const fn tag(self) -> i32 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::F16 => 2,
            DType::I8 => 3,
            DType::ComplexF32 => 4,
            DType::ComplexF64 => 5,
            DType::ComplexF16 => 6,
            DType::U8 => 8,
            DType::I32 => 10,
            DType::U32 => 12,
            DType::BF16 => 14,
            DType::ComplexBF16 => 15,
            DType::I4 => 16,
            DType::U4 => 18,
            DType::I16 => 20,
            DType::U16 => 22,
            DType::I64 => 24,
            DType::U64 => 26,
            DType::Bool => 28,
        }
    }

    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::all().iter().copied().find(|dtype| dtype.tag() == tag)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 8,
            DType::I4 | DType::U4 => 4,
            DType::F16 | DType::BF16 | DType::I16 | DType::U16 => 16,
            DType::F32 | DType::I32 | DType::U32 | DType::ComplexF16 | DType::ComplexBF16 => 32,
            DType::F64 | DType::I64 | DType::U64 | DType::ComplexF32 => 64,
            DType::ComplexF64 => 128,
        }
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(
            self,
            DType::ComplexF16 | DType::ComplexBF16 | DType::ComplexF32 | DType::ComplexF64
        )
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I4
                | DType::U4
                | DType::I8
                | DType::U8
                | DType::I16
                | DType::U16
                | DType::I32
                | DType::U32
                | DType::I64
                | DType::U64
        )
    }

    #[must_use]
    pub const fn is_bool(self) -> bool {
        matches!(self, DType::Bool)
    }

    #[must_use]
    pub const fn is_numeric(self) -> bool {
        self.is_integer() || self.is_floating() || self.is_complex()
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        self.is_floating()
            || matches!(
                self,
                DType::I4 | DType::I8 | DType::I16 | DType::I32 | DType::I64
            )
    }

    /// Ordered comparison is defined for real numeric types only.
    #[must_use]
    pub const fn is_comparable(self) -> bool {
        self.is_integer() || self.is_floating()
    }

    #[must_use]
    pub const fn is_equatable(self) -> bool {
        self.is_numeric() || self.is_bool()
    }

    /// True when a host [`Storage`] variant exists for this tag.
    #[must_use]
    pub const fn is_instantiated(self) -> bool {
        matches!(
            self,
            DType::Bool
                | DType::U8
                | DType::I8
                | DType::U16
                | DType::I16
                | DType::I32
                | DType::F16
                | DType::BF16
                | DType::F32
                | DType::F64
                | DType::ComplexF32
        )
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::ComplexF16 => "complex_f16",
            DType::ComplexBF16 => "complex_bf16",
            DType::ComplexF32 => "complex_f32",
            DType::ComplexF64 => "complex_f64",
            DType::I4 => "i4",
            DType::U4 => "u4",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::U16 => "u16",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I64 => "i64",
            DType::U64 => "u64",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOrder {
    ColumnMajor,
    RowMajor,
    Other,
}

impl StorageOrder {
    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::ColumnMajor),
            1 => Some(Self::RowMajor),
            2..=4 => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

/// Shape, layout and element type of one kernel operand.
///
/// `count` and `span_count` are derived on construction: a descriptor is
/// dense when both agree and single when it touches exactly one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    dtype: DType,
    order: StorageOrder,
    shape: Vec<usize>,
    strides: Vec<usize>,
    logical_strides: Vec<usize>,
    count: usize,
    span_count: usize,
    storage_offset: usize,
}

impl TensorDescriptor {
    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            order: StorageOrder::RowMajor,
            shape: Vec::new(),
            strides: Vec::new(),
            logical_strides: Vec::new(),
            count: 1,
            span_count: 1,
            storage_offset: 0,
        }
    }

    /// Dense row-major descriptor. Extents whose product overflows
    /// saturate the derived counts instead of failing.
    #[must_use]
    pub fn dense(dtype: DType, shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        Self::assemble(dtype, StorageOrder::RowMajor, shape, strides, 0)
    }

    #[must_use]
    pub fn column_major(dtype: DType, shape: Vec<usize>) -> Self {
        let strides = column_major_strides(&shape);
        let order = if shape.len() > 1 {
            StorageOrder::ColumnMajor
        } else {
            StorageOrder::RowMajor
        };
        Self::assemble(dtype, order, shape, strides, 0)
    }

    pub fn from_shape_and_strides(
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
    ) -> Result<Self, DescriptorError> {
        validate_layout(&shape, &strides, storage_offset)?;
        let order = infer_order(&shape, &strides);
        Ok(Self::assemble(dtype, order, shape, strides, storage_offset))
    }

    /// Decodes the boundary representation. Strict mode rejects
    /// inconsistent derived fields; hardened mode recomputes them and
    /// reports which ones were replaced.
    pub fn from_raw(
        raw: &RawTensorDescriptor<'_>,
        mode: ExecutionMode,
    ) -> Result<DescriptorDecode, DescriptorError> {
        let dtype = DType::from_tag(raw.type_tag)
            .ok_or(DescriptorError::UnknownTypeTag { tag: raw.type_tag })?;
        let order = StorageOrder::from_tag(raw.order_tag)
            .ok_or(DescriptorError::UnknownOrderTag { tag: raw.order_tag })?;
        let rank = raw.rank as usize;
        for (array, values) in [
            ("shape", raw.shape),
            ("strides", raw.strides),
            ("logical_strides", raw.logical_strides),
        ] {
            if values.len() < rank {
                return Err(DescriptorError::MissingDimensions {
                    array,
                    rank,
                    len: values.len(),
                });
            }
        }

        let shape = raw.shape[..rank].to_vec();
        let strides = raw.strides[..rank].to_vec();
        validate_layout(&shape, &strides, 0)?;
        let descriptor = Self::assemble(dtype, order, shape, strides, 0);

        let mut repaired = Vec::new();
        if raw.count != descriptor.count {
            if mode == ExecutionMode::Strict {
                return Err(DescriptorError::CountMismatch {
                    declared: raw.count,
                    computed: descriptor.count,
                });
            }
            repaired.push("count");
        }
        if raw.span_count != descriptor.span_count {
            if mode == ExecutionMode::Strict {
                return Err(DescriptorError::SpanMismatch {
                    declared: raw.span_count,
                    computed: descriptor.span_count,
                });
            }
            repaired.push("span_count");
        }
        if raw.logical_strides[..rank] != descriptor.logical_strides[..] {
            if mode == ExecutionMode::Strict {
                return Err(DescriptorError::LogicalStridesMismatch {
                    declared: raw.logical_strides[..rank].to_vec(),
                    computed: descriptor.logical_strides.clone(),
                });
            }
            repaired.push("logical_strides");
        }

        Ok(DescriptorDecode {
            descriptor,
            repaired,
        })
    }

    fn assemble(
        dtype: DType,
        order: StorageOrder,
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
    ) -> Self {
        let count = shape
            .iter()
            .copied()
            .fold(1usize, |acc, size| acc.saturating_mul(size));
        let span_count = span_of(&shape, &strides, count);
        let logical_strides = contiguous_strides(&shape);
        Self {
            dtype,
            order,
            shape,
            strides,
            logical_strides,
            count,
            span_count,
            storage_offset,
        }
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Right-aligned broadcast view. Missing leading axes and axes of
    /// extent 1 map to stride 0.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Self, DescriptorError> {
        if target.len() < self.rank() {
            return Err(DescriptorError::BroadcastMismatch {
                shape: self.shape.clone(),
                target: target.to_vec(),
            });
        }
        if target == self.shape.as_slice() {
            return Ok(self.clone());
        }

        let lead = target.len() - self.rank();
        let mut strides = vec![0usize; target.len()];
        for (axis, extent) in target.iter().copied().enumerate().skip(lead) {
            let source = axis - lead;
            let size = self.shape[source];
            if size == extent {
                strides[axis] = self.strides[source];
            } else if size != 1 {
                return Err(DescriptorError::BroadcastMismatch {
                    shape: self.shape.clone(),
                    target: target.to_vec(),
                });
            }
        }

        validate_layout(target, &strides, self.storage_offset)?;
        Ok(Self::assemble(
            self.dtype,
            StorageOrder::Other,
            target.to_vec(),
            strides,
            self.storage_offset,
        ))
    }

    pub fn permuted(&self, axes: &[usize]) -> Result<Self, DescriptorError> {
        let mut seen = vec![false; self.rank()];
        let valid = axes.len() == self.rank()
            && axes.iter().all(|&axis| {
                axis < seen.len() && !std::mem::replace(&mut seen[axis], true)
            });
        if !valid {
            return Err(DescriptorError::InvalidPermutation {
                axes: axes.to_vec(),
                rank: self.rank(),
            });
        }

        let shape = axes.iter().map(|&axis| self.shape[axis]).collect::<Vec<_>>();
        let strides = axes
            .iter()
            .map(|&axis| self.strides[axis])
            .collect::<Vec<_>>();
        let order = infer_order(&shape, &strides);
        Ok(Self::assemble(
            self.dtype,
            order,
            shape,
            strides,
            self.storage_offset,
        ))
    }

    /// Rank-0 descriptors become a one-element rank-1 view; others are
    /// returned unchanged.
    #[must_use]
    pub fn rank1(&self) -> Self {
        if self.rank() > 0 {
            return self.clone();
        }
        Self::assemble(
            self.dtype,
            StorageOrder::RowMajor,
            vec![1],
            vec![1],
            self.storage_offset,
        )
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn order(&self) -> StorageOrder {
        self.order
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn logical_strides(&self) -> &[usize] {
        &self.logical_strides
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn span_count(&self) -> usize {
        self.span_count
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.count == self.span_count
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.span_count == 1
    }

    #[must_use]
    pub fn is_strided(&self) -> bool {
        !self.is_dense()
    }

    /// Row-major contiguity; singleton axes are ignored.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// True when some axis of extent > 1 has stride 0.
    #[must_use]
    pub fn has_broadcast_axis(&self) -> bool {
        self.shape
            .iter()
            .zip(&self.strides)
            .any(|(&size, &stride)| size > 1 && stride == 0)
    }

    /// Minimum buffer length that covers every element of the view.
    #[must_use]
    pub fn required_len(&self) -> usize {
        if self.span_count == 0 {
            return 0;
        }
        self.storage_offset.saturating_add(self.span_count)
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, DescriptorError> {
        if index.len() != self.rank() {
            return Err(DescriptorError::IndexRankMismatch {
                expected: self.rank(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(DescriptorError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }
            let step = idx
                .checked_mul(stride)
                .ok_or(DescriptorError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(DescriptorError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }
        Ok(linear)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.dtype.hash(&mut hasher);
        self.order.hash(&mut hasher);
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        hasher.finish()
    }
}

/// Descriptor as it crosses the C boundary: caller-owned dimension arrays
/// that only need to live for the duration of the call. An array shorter
/// than `rank` stands for a null pointer.
#[derive(Debug, Clone, Copy)]
pub struct RawTensorDescriptor<'a> {
    pub type_tag: i32,
    pub rank: u32,
    pub order_tag: i32,
    pub count: usize,
    pub span_count: usize,
    pub shape: &'a [usize],
    pub strides: &'a [usize],
    pub logical_strides: &'a [usize],
}

impl<'a> RawTensorDescriptor<'a> {
    /// Wire view of an existing descriptor. The arrays are borrowed from it.
    #[must_use]
    pub fn of(descriptor: &'a TensorDescriptor) -> Self {
        let order_tag = match descriptor.order {
            StorageOrder::ColumnMajor => 0,
            StorageOrder::RowMajor => 1,
            StorageOrder::Other => 2,
        };
        Self {
            type_tag: descriptor.dtype.tag(),
            rank: u32::try_from(descriptor.rank()).unwrap_or(u32::MAX),
            order_tag,
            count: descriptor.count,
            span_count: descriptor.span_count,
            shape: &descriptor.shape,
            strides: &descriptor.strides,
            logical_strides: &descriptor.logical_strides,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDecode {
    pub descriptor: TensorDescriptor,
    pub repaired: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    CountOverflow {
        shape: Vec<usize>,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
    BroadcastMismatch {
        shape: Vec<usize>,
        target: Vec<usize>,
    },
    InvalidPermutation {
        axes: Vec<usize>,
        rank: usize,
    },
    UnknownTypeTag {
        tag: i32,
    },
    UnknownOrderTag {
        tag: i32,
    },
    MissingDimensions {
        array: &'static str,
        rank: usize,
        len: usize,
    },
    CountMismatch {
        declared: usize,
        computed: usize,
    },
    SpanMismatch {
        declared: usize,
        computed: usize,
    },
    LogicalStridesMismatch {
        declared: Vec<usize>,
        computed: Vec<usize>,
    },
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::CountOverflow { shape } => {
                write!(f, "element count overflows for shape={shape:?}")
            }
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
            Self::BroadcastMismatch { shape, target } => {
                write!(f, "shape {shape:?} cannot broadcast to {target:?}")
            }
            Self::InvalidPermutation { axes, rank } => {
                write!(f, "axes {axes:?} are not a permutation of rank {rank}")
            }
            Self::UnknownTypeTag { tag } => write!(f, "unknown element type tag {tag}"),
            Self::UnknownOrderTag { tag } => write!(f, "unknown storage order tag {tag}"),
            Self::MissingDimensions { array, rank, len } => write!(
                f,
                "{array} has {len} entries but rank is {rank}"
            ),
            Self::CountMismatch { declared, computed } => write!(
                f,
                "declared count {declared} does not match shape product {computed}"
            ),
            Self::SpanMismatch { declared, computed } => write!(
                f,
                "declared span {declared} does not match computed span {computed}"
            ),
            Self::LogicalStridesMismatch { declared, computed } => write!(
                f,
                "logical strides {declared:?} do not match row-major strides {computed:?}"
            ),
        }
    }
}

impl std::error::Error for DescriptorError {}

fn validate_layout(
    shape: &[usize],
    strides: &[usize],
    storage_offset: usize,
) -> Result<(), DescriptorError> {
    if shape.len() != strides.len() {
        return Err(DescriptorError::RankStrideMismatch {
            rank: shape.len(),
            strides: strides.len(),
        });
    }

    let mut count = 1usize;
    let mut max_linear_offset = 0usize;
    for (size, stride) in shape.iter().copied().zip(strides.iter().copied()) {
        count = count
            .checked_mul(size)
            .ok_or_else(|| DescriptorError::CountOverflow {
                shape: shape.to_vec(),
            })?;
        if size == 0 {
            continue;
        }

        let span = stride
            .checked_mul(size - 1)
            .ok_or(DescriptorError::StrideOverflow { size, stride })?;
        max_linear_offset = max_linear_offset.checked_add(span).ok_or(
            DescriptorError::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            },
        )?;
    }

    storage_offset
        .checked_add(max_linear_offset)
        .and_then(|last| last.checked_add(1))
        .ok_or(DescriptorError::StorageOffsetOverflow {
            storage_offset,
            max_linear_offset,
        })?;
    Ok(())
}

fn span_of(shape: &[usize], strides: &[usize], count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    shape
        .iter()
        .copied()
        .zip(strides.iter().copied())
        .fold(1usize, |span, (size, stride)| {
            span.saturating_add(size.saturating_sub(1).saturating_mul(stride))
        })
}

fn infer_order(shape: &[usize], strides: &[usize]) -> StorageOrder {
    if shape.len() <= 1 || strides == contiguous_strides(shape).as_slice() {
        StorageOrder::RowMajor
    } else if strides == column_major_strides(shape).as_slice() {
        StorageOrder::ColumnMajor
    } else {
        StorageOrder::Other
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[must_use]
pub fn column_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for (idx, size) in shape.iter().copied().enumerate() {
        strides[idx] = running;
        running = running.saturating_mul(size);
    }
    strides
}

/// Operation parameter carried across the type-erased boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
}

impl Scalar {
    /// Real value of the scalar; `None` for complex values.
    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Scalar::Bool(value) => Some(if value { 1.0 } else { 0.0 }),
            Scalar::Int(value) => Some(value as f64),
            Scalar::Float(value) => Some(value),
            Scalar::Complex { .. } => None,
        }
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Scalar::Complex { .. })
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(storage: &Storage) -> Option<&[Self]>;

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;

    fn into_storage(values: Vec<Self>) -> Storage;

    fn to_scalar(self) -> Scalar;

    /// Converts with `as`-cast semantics; complex to real is refused.
    fn from_scalar(value: Scalar) -> Option<Self>;
}

macro_rules! storage_accessors {
    ($variant:ident) => {
        fn slice(storage: &Storage) -> Option<&[Self]> {
            match storage {
                Storage::$variant(values) => Some(values),
                _ => None,
            }
        }

        fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
            match storage {
                Storage::$variant(values) => Some(values),
                _ => None,
            }
        }

        fn into_storage(values: Vec<Self>) -> Storage {
            Storage::$variant(values)
        }
    };
}

macro_rules! integer_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$variant;

                storage_accessors!($variant);

                fn to_scalar(self) -> Scalar {
                    Scalar::Int(i64::from(self))
                }

                fn from_scalar(value: Scalar) -> Option<Self> {
                    match value {
                        Scalar::Bool(flag) => Some(if flag { 1 } else { 0 }),
                        Scalar::Int(value) => Some(value as $ty),
                        Scalar::Float(value) => Some(value as $ty),
                        Scalar::Complex { .. } => None,
                    }
                }
            }
        )*
    };
}

integer_element!(u8 => U8, i8 => I8, u16 => U16, i16 => I16, i32 => I32);

macro_rules! float_element {
    ($ty:ty => $variant:ident, $to:expr, $from:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            storage_accessors!($variant);

            fn to_scalar(self) -> Scalar {
                Scalar::Float($to(self))
            }

            fn from_scalar(value: Scalar) -> Option<Self> {
                value.as_f64().map($from)
            }
        }
    };
}

float_element!(f32 => F32, f64::from, |value: f64| value as f32);
float_element!(f64 => F64, |value: f64| value, |value: f64| value);
float_element!(f16 => F16, f16::to_f64, f16::from_f64);
float_element!(bf16 => BF16, bf16::to_f64, bf16::from_f64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    storage_accessors!(Bool);

    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }

    fn from_scalar(value: Scalar) -> Option<Self> {
        match value {
            Scalar::Bool(flag) => Some(flag),
            Scalar::Int(value) => Some(value != 0),
            Scalar::Float(value) => Some(value != 0.0),
            Scalar::Complex { .. } => None,
        }
    }
}

impl Element for Complex32 {
    const DTYPE: DType = DType::ComplexF32;

    storage_accessors!(ComplexF32);

    fn to_scalar(self) -> Scalar {
        Scalar::Complex {
            re: f64::from(self.re),
            im: f64::from(self.im),
        }
    }

    fn from_scalar(value: Scalar) -> Option<Self> {
        match value {
            Scalar::Complex { re, im } => Some(Complex32::new(re as f32, im as f32)),
            real => real.as_f64().map(|re| Complex32::new(re as f32, 0.0)),
        }
    }
}

/// Host-side typed element storage, one variant per instantiated dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    ComplexF32(Vec<Complex32>),
}

macro_rules! each_storage {
    ($storage:expr, $values:ident => $body:expr) => {
        match $storage {
            Storage::Bool($values) => $body,
            Storage::U8($values) => $body,
            Storage::I8($values) => $body,
            Storage::U16($values) => $body,
            Storage::I16($values) => $body,
            Storage::I32($values) => $body,
            Storage::F16($values) => $body,
            Storage::BF16($values) => $body,
            Storage::F32($values) => $body,
            Storage::F64($values) => $body,
            Storage::ComplexF32($values) => $body,
        }
    };
}

impl Storage {
    #[must_use]
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        T::into_storage(values)
    }

    pub fn zeros(dtype: DType, len: usize) -> Result<Self, StorageError> {
        Self::splat(dtype, Scalar::Int(0), len)
    }

    /// `len` copies of `value` converted to `dtype`.
    pub fn splat(dtype: DType, value: Scalar, len: usize) -> Result<Self, StorageError> {
        fn fill<T: Element>(value: Scalar, len: usize) -> Result<Storage, StorageError> {
            let element = T::from_scalar(value).ok_or(StorageError::ScalarConversion {
                dtype: T::DTYPE,
                value,
            })?;
            Ok(T::into_storage(vec![element; len]))
        }

        match dtype {
            DType::Bool => fill::<bool>(value, len),
            DType::U8 => fill::<u8>(value, len),
            DType::I8 => fill::<i8>(value, len),
            DType::U16 => fill::<u16>(value, len),
            DType::I16 => fill::<i16>(value, len),
            DType::I32 => fill::<i32>(value, len),
            DType::F16 => fill::<f16>(value, len),
            DType::BF16 => fill::<bf16>(value, len),
            DType::F32 => fill::<f32>(value, len),
            DType::F64 => fill::<f64>(value, len),
            DType::ComplexF32 => fill::<Complex32>(value, len),
            other => Err(StorageError::NotInstantiated { dtype: other }),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Storage::Bool(_) => DType::Bool,
            Storage::U8(_) => DType::U8,
            Storage::I8(_) => DType::I8,
            Storage::U16(_) => DType::U16,
            Storage::I16(_) => DType::I16,
            Storage::I32(_) => DType::I32,
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::ComplexF32(_) => DType::ComplexF32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        each_storage!(self, values => values.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn typed<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    pub fn typed_mut<T: Element>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(self)
    }

    /// Element at `index` as a [`Scalar`], regardless of the element type.
    #[must_use]
    pub fn scalar_at(&self, index: usize) -> Option<Scalar> {
        each_storage!(self, values => values.get(index).map(|value| value.to_scalar()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageError {
    NotInstantiated { dtype: DType },
    ScalarConversion { dtype: DType, value: Scalar },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstantiated { dtype } => {
                write!(f, "no host storage is instantiated for dtype {dtype}")
            }
            Self::ScalarConversion { dtype, value } => {
                write!(f, "scalar {value:?} cannot be represented as {dtype}")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        Complex32, DType, DescriptorError, ExecutionMode, RawTensorDescriptor, Scalar, Storage,
        StorageError, StorageOrder, TensorDescriptor, bf16, contiguous_strides, f16,
    };

    #[test]
    fn scalar_descriptor_is_single_and_dense() {
        let desc = TensorDescriptor::scalar(DType::F32);
        assert_eq!(desc.rank(), 0);
        assert_eq!(desc.count(), 1);
        assert_eq!(desc.span_count(), 1);
        assert!(desc.is_dense());
        assert!(desc.is_single());
    }

    #[test]
    fn dense_shape_builds_row_major_strides() {
        let desc = TensorDescriptor::dense(DType::F64, vec![2, 3, 4]);
        assert_eq!(desc.strides(), &[12, 4, 1]);
        assert_eq!(desc.logical_strides(), &[12, 4, 1]);
        assert_eq!(desc.count(), 24);
        assert_eq!(desc.span_count(), 24);
        assert_eq!(desc.order(), StorageOrder::RowMajor);
        assert!(desc.is_dense());
        assert!(desc.is_contiguous());
    }

    #[test]
    fn column_major_is_dense_but_not_contiguous() {
        let desc = TensorDescriptor::column_major(DType::F32, vec![2, 3]);
        assert_eq!(desc.strides(), &[1, 2]);
        assert_eq!(desc.logical_strides(), &[3, 1]);
        assert_eq!(desc.order(), StorageOrder::ColumnMajor);
        assert!(desc.is_dense());
        assert!(!desc.is_contiguous());
    }

    #[test]
    fn row_broadcast_is_not_dense() {
        let desc = TensorDescriptor::from_shape_and_strides(DType::F32, vec![2, 3], vec![0, 1], 0)
            .expect("broadcast layout should validate");
        assert_eq!(desc.count(), 6);
        assert_eq!(desc.span_count(), 3);
        assert!(!desc.is_dense());
        assert!(desc.has_broadcast_axis());
        assert_eq!(desc.storage_index_for(&[1, 2]).expect("index 1,2"), 2);
    }

    #[test]
    fn scalar_broadcast_is_single() {
        let desc = TensorDescriptor::scalar(DType::I32)
            .broadcast_to(&[4, 5])
            .expect("scalar broadcasts anywhere");
        assert_eq!(desc.strides(), &[0, 0]);
        assert_eq!(desc.count(), 20);
        assert!(desc.is_single());
    }

    #[test]
    fn broadcast_aligns_trailing_axes() {
        let row = TensorDescriptor::dense(DType::F32, vec![3]);
        let desc = row.broadcast_to(&[2, 3]).expect("row broadcast");
        assert_eq!(desc.strides(), &[0, 1]);

        let column = TensorDescriptor::dense(DType::F32, vec![2, 1]);
        let desc = column.broadcast_to(&[2, 3]).expect("column broadcast");
        assert_eq!(desc.strides(), &[1, 0]);

        let err = TensorDescriptor::dense(DType::F32, vec![2])
            .broadcast_to(&[2, 3])
            .expect_err("incompatible extent must fail");
        assert!(matches!(err, DescriptorError::BroadcastMismatch { .. }));
    }

    #[test]
    fn permutation_swaps_strides_and_recomputes_logical_strides() {
        let desc = TensorDescriptor::dense(DType::F32, vec![2, 3]);
        let transposed = desc.permuted(&[1, 0]).expect("valid permutation");
        assert_eq!(transposed.shape(), &[3, 2]);
        assert_eq!(transposed.strides(), &[1, 3]);
        assert_eq!(transposed.logical_strides(), &[2, 1]);
        assert_eq!(transposed.order(), StorageOrder::ColumnMajor);
        assert!(transposed.is_dense());

        let err = desc.permuted(&[0, 0]).expect_err("repeated axis");
        assert!(matches!(err, DescriptorError::InvalidPermutation { .. }));
    }

    #[test]
    fn index_rank_and_bounds_are_guarded() {
        let desc = TensorDescriptor::dense(DType::F64, vec![2, 3]);

        let rank_err = desc
            .storage_index_for(&[1])
            .expect_err("rank mismatch should fail");
        assert!(matches!(
            rank_err,
            DescriptorError::IndexRankMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let oob_err = desc
            .storage_index_for(&[2, 0])
            .expect_err("out-of-bounds index should fail");
        assert!(matches!(
            oob_err,
            DescriptorError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            }
        ));
    }

    #[test]
    fn storage_offset_extends_required_len() {
        let desc = TensorDescriptor::dense(DType::F32, vec![3]).with_storage_offset(2);
        assert_eq!(desc.required_len(), 5);
        assert_eq!(desc.storage_index_for(&[0]).expect("index 0"), 2);

        let empty = TensorDescriptor::dense(DType::F32, vec![0, 4]).with_storage_offset(9);
        assert_eq!(empty.span_count(), 0);
        assert_eq!(empty.required_len(), 0);
    }

    #[test]
    fn raw_descriptor_roundtrips_in_strict_mode() {
        let desc = TensorDescriptor::dense(DType::BF16, vec![4, 2]);
        let decoded = TensorDescriptor::from_raw(&RawTensorDescriptor::of(&desc), ExecutionMode::Strict)
            .expect("consistent descriptor should decode");
        assert_eq!(decoded.descriptor, desc);
        assert!(decoded.repaired.is_empty());
    }

    #[test]
    fn raw_descriptor_with_short_arrays_is_rejected() {
        let shape = [2usize, 3];
        let raw = RawTensorDescriptor {
            type_tag: DType::F32.tag(),
            rank: 2,
            order_tag: 1,
            count: 6,
            span_count: 6,
            shape: &shape,
            strides: &[],
            logical_strides: &[3, 1],
        };
        let err = TensorDescriptor::from_raw(&raw, ExecutionMode::Hardened)
            .expect_err("missing strides must fail in every mode");
        assert!(matches!(
            err,
            DescriptorError::MissingDimensions {
                array: "strides",
                rank: 2,
                len: 0
            }
        ));
    }

    #[test]
    fn raw_descriptor_count_mismatch_splits_by_mode() {
        let shape = [2usize, 3];
        let strides = [3usize, 1];
        let raw = RawTensorDescriptor {
            type_tag: DType::F32.tag(),
            rank: 2,
            order_tag: 1,
            count: 5,
            span_count: 7,
            shape: &shape,
            strides: &strides,
            logical_strides: &strides,
        };

        let err = TensorDescriptor::from_raw(&raw, ExecutionMode::Strict)
            .expect_err("strict mode must fail closed");
        assert!(matches!(
            err,
            DescriptorError::CountMismatch {
                declared: 5,
                computed: 6
            }
        ));

        let decoded = TensorDescriptor::from_raw(&raw, ExecutionMode::Hardened)
            .expect("hardened mode repairs derived fields");
        assert_eq!(decoded.descriptor.count(), 6);
        assert_eq!(decoded.descriptor.span_count(), 6);
        assert_eq!(decoded.repaired, vec!["count", "span_count"]);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let raw = RawTensorDescriptor {
            type_tag: 99,
            rank: 0,
            order_tag: 1,
            count: 1,
            span_count: 1,
            shape: &[],
            strides: &[],
            logical_strides: &[],
        };
        let err = TensorDescriptor::from_raw(&raw, ExecutionMode::Strict)
            .expect_err("unknown dtype tag");
        assert_eq!(err, DescriptorError::UnknownTypeTag { tag: 99 });
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn dtype_tags_are_unique_and_roundtrip() {
        for dtype in DType::all() {
            assert_eq!(DType::from_tag(dtype.tag()), Some(*dtype));
        }
        assert_eq!(DType::from_tag(7), None);
    }

    #[test]
    fn dtype_predicates_partition_the_catalog() {
        assert!(DType::F16.is_floating() && DType::F16.is_signed());
        assert!(DType::U8.is_integer() && !DType::U8.is_signed());
        assert!(DType::ComplexF32.is_numeric() && !DType::ComplexF32.is_comparable());
        assert!(DType::Bool.is_equatable() && !DType::Bool.is_numeric());
        assert!(!DType::I64.is_instantiated());
    }

    #[test]
    fn scalar_conversions_follow_cast_semantics() {
        let storage = Storage::splat(DType::U8, Scalar::Int(258), 2).expect("u8 splat");
        assert_eq!(storage, Storage::U8(vec![2, 2]));

        let storage = Storage::splat(DType::F16, Scalar::Float(1.5), 1).expect("f16 splat");
        assert_eq!(storage, Storage::F16(vec![f16::from_f32(1.5)]));

        let storage = Storage::splat(DType::ComplexF32, Scalar::Float(2.0), 1).expect("complex");
        assert_eq!(storage, Storage::ComplexF32(vec![Complex32::new(2.0, 0.0)]));

        let err = Storage::splat(DType::F32, Scalar::Complex { re: 1.0, im: 1.0 }, 1)
            .expect_err("complex to real is refused");
        assert!(matches!(err, StorageError::ScalarConversion { .. }));

        let err = Storage::zeros(DType::U64, 4).expect_err("u64 has no storage");
        assert_eq!(err, StorageError::NotInstantiated { dtype: DType::U64 });
    }

    #[test]
    fn storage_reports_dtype_len_and_scalars() {
        let storage = Storage::from_vec(vec![bf16::from_f32(1.0), bf16::from_f32(-2.0)]);
        assert_eq!(storage.dtype(), DType::BF16);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.scalar_at(1), Some(Scalar::Float(-2.0)));
        assert_eq!(storage.scalar_at(2), None);
        assert!(storage.typed::<f32>().is_none());
    }

    #[test]
    fn fingerprint_changes_when_offset_changes() {
        let a = TensorDescriptor::dense(DType::F64, vec![2, 2]);
        let b = a.clone().with_storage_offset(1);
        assert_ne!(a.fingerprint64(), b.fingerprint64());
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
            for axis in 1..shape.len() {
                prop_assert_eq!(strides[axis - 1], strides[axis] * shape[axis]);
            }
        }

        #[test]
        fn prop_dense_count_equals_span(shape in prop::collection::vec(1usize..=6, 1..=3)) {
            let desc = TensorDescriptor::dense(DType::F32, shape.clone());
            let expected: usize = shape.iter().copied().product();
            prop_assert_eq!(desc.count(), expected);
            prop_assert_eq!(desc.span_count(), expected);
            prop_assert!(desc.is_dense());

            let permuted = desc
                .permuted(&(0..shape.len()).rev().collect::<Vec<_>>())
                .expect("reversal is a permutation");
            prop_assert!(permuted.is_dense());
            prop_assert_eq!(permuted.count(), expected);
        }

        #[test]
        fn prop_broadcast_shrinks_span(
            shape in prop::collection::vec(2usize..=5, 2..=3),
            axis in 0usize..3,
        ) {
            let axis = axis % shape.len();
            let mut source = shape.clone();
            source[axis] = 1;
            let desc = TensorDescriptor::dense(DType::F32, source)
                .broadcast_to(&shape)
                .expect("extent-1 axis broadcasts");
            prop_assert_eq!(desc.strides()[axis], 0);
            prop_assert!(desc.span_count() < desc.count());
            prop_assert!(!desc.is_dense());
            prop_assert_eq!(desc.span_count() * shape[axis], desc.count());
            prop_assert_ne!(
                desc.fingerprint64(),
                TensorDescriptor::dense(DType::F32, shape.clone()).fingerprint64()
            );
        }

        #[test]
        fn prop_rank_stride_mismatch_fail_closed(
            shape in prop::collection::vec(1usize..=4, 1..=4),
            extra in 1usize..=3,
        ) {
            let strides = vec![1usize; shape.len() + extra];
            let err = TensorDescriptor::from_shape_and_strides(DType::F32, shape.clone(), strides, 0)
                .expect_err("rank/stride mismatch must fail");

            match err {
                DescriptorError::RankStrideMismatch { .. } => {}
                other => prop_assert!(false, "expected RankStrideMismatch, got {other:?}"),
            }
        }
    }
}
