#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};
use tg_core::TensorDescriptor;

/// Highest rank with a direct kernel instantiation.
pub const MAX_RANK: usize = 3;
pub const MAX_BLOCK_THREADS: u32 = 1024;
pub const MAX_BLOCK_Z: u32 = 64;
pub const MAX_GRID_X: u32 = i32::MAX as u32;
pub const MAX_GRID_YZ: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn volume(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Coordinates of one execution thread inside a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCoord {
    pub block_idx: Dim3,
    pub block_dim: Dim3,
    pub thread_idx: Dim3,
}

impl GridCoord {
    #[must_use]
    pub fn global(&self) -> Dim3 {
        let axis = |block: u32, extent: u32, thread: u32| {
            block.wrapping_mul(extent).wrapping_add(thread)
        };
        Dim3 {
            x: axis(self.block_idx.x, self.block_dim.x, self.thread_idx.x),
            y: axis(self.block_idx.y, self.block_dim.y, self.thread_idx.y),
            z: axis(self.block_idx.z, self.block_dim.z, self.thread_idx.z),
        }
    }
}

/// A rank-`R` logical coordinate.
///
/// Built from the grid so that the last logical axis (the fastest varying
/// one in row-major order) always rides on grid x: rank 2 reads `[y, x]`
/// and rank 3 reads `[z, y, x]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Logical<const R: usize> {
    coords: [u32; R],
}

impl<const R: usize> Logical<R> {
    #[must_use]
    pub const fn new(coords: [u32; R]) -> Self {
        Self { coords }
    }

    #[must_use]
    pub fn from_grid(coord: &GridCoord) -> Self {
        const { assert!(R >= 1 && R <= MAX_RANK, "logical positions cover ranks 1..=3") };
        let global = coord.global();
        let lanes = [global.x, global.y, global.z];
        Self {
            coords: std::array::from_fn(|axis| lanes[R - 1 - axis]),
        }
    }

    /// Inverse of the row-major enumeration of `shape`.
    #[must_use]
    pub fn from_sequence(sequence: u32, shape: &[u32; R]) -> Self {
        let mut rest = sequence;
        let mut coords = [0u32; R];
        for axis in (0..R).rev() {
            let extent = shape[axis].max(1);
            coords[axis] = rest % extent;
            rest /= extent;
        }
        Self { coords }
    }

    #[must_use]
    pub fn coords(&self) -> &[u32; R] {
        &self.coords
    }

    #[must_use]
    pub fn with_axis(mut self, axis: usize, value: u32) -> Self {
        self.coords[axis] = value;
        self
    }
}

impl<const R: usize> Index<usize> for Logical<R> {
    type Output = u32;

    fn index(&self, axis: usize) -> &u32 {
        &self.coords[axis]
    }
}

/// Per-operand mapping from logical positions to storage offsets.
pub trait IndexStrategy<const R: usize>: Copy + Send + Sync {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool;

    /// Physical element offset relative to the start of the view.
    fn linear(&self, position: &Logical<R>) -> u32;
}

/// Strategies that can also rank a position in dense row-major order.
pub trait SequenceIndex<const R: usize>: IndexStrategy<R> {
    fn sequence(&self, position: &Logical<R>) -> u32;
}

fn narrow(value: usize) -> Result<u32, IndexError> {
    u32::try_from(value).map_err(|_| IndexError::DimensionOverflow { value })
}

/// Fails when any extent, stride or derived size of `desc` falls outside
/// the 32-bit arithmetic every strategy indexes with.
pub fn ensure_addressable(desc: &TensorDescriptor) -> Result<(), IndexError> {
    narrow(desc.count())?;
    narrow(desc.span_count())?;
    for value in desc
        .shape()
        .iter()
        .chain(desc.strides())
        .chain(desc.logical_strides())
    {
        narrow(*value)?;
    }
    Ok(())
}

fn narrow_array<const R: usize>(values: &[usize]) -> Result<[u32; R], IndexError> {
    let mut out = [0u32; R];
    for (slot, value) in out.iter_mut().zip(values.iter().copied()) {
        *slot = narrow(value)?;
    }
    Ok(out)
}

fn ensure_rank<const R: usize>(desc: &TensorDescriptor) -> Result<(), IndexError> {
    if desc.rank() != R {
        return Err(IndexError::RankMismatch {
            expected: R,
            actual: desc.rank(),
        });
    }
    Ok(())
}

fn within<const R: usize>(shape: &[u32; R], position: &Logical<R>) -> bool {
    shape
        .iter()
        .zip(position.coords())
        .all(|(extent, coord)| coord < extent)
}

fn dot<const R: usize>(strides: &[u32; R], position: &Logical<R>) -> u32 {
    strides
        .iter()
        .zip(position.coords())
        .fold(0u32, |acc, (stride, coord)| {
            acc.wrapping_add(coord.wrapping_mul(*stride))
        })
}

/// Operand whose whole view is one stored element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Single<const R: usize> {
    shape: [u32; R],
}

impl<const R: usize> Single<R> {
    /// A rank-1 launch views the operand as its flattened element count.
    pub fn new(desc: &TensorDescriptor) -> Result<Self, IndexError> {
        if !desc.is_single() {
            return Err(IndexError::NotSingle {
                span_count: desc.span_count(),
            });
        }
        if R == 1 && desc.rank() != 1 {
            return Ok(Self {
                shape: narrow_array::<R>(&[desc.count()])?,
            });
        }
        ensure_rank::<R>(desc)?;
        Ok(Self {
            shape: narrow_array::<R>(desc.shape())?,
        })
    }
}

impl<const R: usize> IndexStrategy<R> for Single<R> {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool {
        within(&self.shape, position)
    }

    fn linear(&self, _position: &Logical<R>) -> u32 {
        0
    }
}

impl<const R: usize> SequenceIndex<R> for Single<R> {
    fn sequence(&self, position: &Logical<R>) -> u32 {
        self.shape
            .iter()
            .zip(position.coords())
            .fold(0u32, |acc, (extent, coord)| {
                acc.wrapping_mul(*extent).wrapping_add(*coord)
            })
    }
}

/// Dense operand addressed by its element ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flat {
    count: u32,
}

impl Flat {
    pub fn new(desc: &TensorDescriptor) -> Result<Self, IndexError> {
        if !desc.is_dense() {
            return Err(IndexError::NotDense {
                count: desc.count(),
                span_count: desc.span_count(),
            });
        }
        Ok(Self {
            count: narrow(desc.count())?,
        })
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl IndexStrategy<1> for Flat {
    fn is_in_bounds(&self, position: &Logical<1>) -> bool {
        position[0] < self.count
    }

    fn linear(&self, position: &Logical<1>) -> u32 {
        position[0]
    }
}

impl SequenceIndex<1> for Flat {
    fn sequence(&self, position: &Logical<1>) -> u32 {
        position[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strided<const R: usize> {
    shape: [u32; R],
    strides: [u32; R],
}

impl<const R: usize> Strided<R> {
    pub fn new(desc: &TensorDescriptor) -> Result<Self, IndexError> {
        ensure_rank::<R>(desc)?;
        narrow(desc.span_count())?;
        Ok(Self {
            shape: narrow_array::<R>(desc.shape())?,
            strides: narrow_array::<R>(desc.strides())?,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[u32; R] {
        &self.shape
    }
}

impl<const R: usize> IndexStrategy<R> for Strided<R> {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool {
        within(&self.shape, position)
    }

    fn linear(&self, position: &Logical<R>) -> u32 {
        dot(&self.strides, position)
    }
}

/// Strided addressing plus the row-major rank of each position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedSeq<const R: usize> {
    strided: Strided<R>,
    logical_strides: [u32; R],
}

impl<const R: usize> StridedSeq<R> {
    pub fn new(desc: &TensorDescriptor) -> Result<Self, IndexError> {
        let strided = Strided::new(desc)?;
        narrow(desc.count())?;
        Ok(Self {
            strided,
            logical_strides: narrow_array::<R>(desc.logical_strides())?,
        })
    }
}

impl<const R: usize> IndexStrategy<R> for StridedSeq<R> {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool {
        self.strided.is_in_bounds(position)
    }

    fn linear(&self, position: &Logical<R>) -> u32 {
        self.strided.linear(position)
    }
}

impl<const R: usize> SequenceIndex<R> for StridedSeq<R> {
    fn sequence(&self, position: &Logical<R>) -> u32 {
        dot(&self.logical_strides, position)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Single,
    Flat,
    Strided,
    StridedSequence,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexKind::Single => "single",
            IndexKind::Flat => "flat",
            IndexKind::Strided => "strided",
            IndexKind::StridedSequence => "strided_seq",
        };
        f.write_str(name)
    }
}

/// Picks the cheapest strategy that is correct for one operand.
///
/// `flat_eligible` is a launch-wide property decided by the caller (every
/// operand dense with a shared layout); `needs_sequence` marks outputs
/// whose values depend on logical order.
#[must_use]
pub fn select_index_kind(
    desc: &TensorDescriptor,
    flat_eligible: bool,
    needs_sequence: bool,
) -> IndexKind {
    if desc.is_single() {
        IndexKind::Single
    } else if flat_eligible && desc.is_dense() {
        IndexKind::Flat
    } else if needs_sequence {
        IndexKind::StridedSequence
    } else {
        IndexKind::Strided
    }
}

/// Runtime choice of strategy for an operand read or written by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandIndex<const R: usize> {
    Single(Single<R>),
    Flat(Flat),
    Strided(Strided<R>),
}

impl<const R: usize> OperandIndex<R> {
    pub fn for_kind(desc: &TensorDescriptor, kind: IndexKind) -> Result<Self, IndexError> {
        match kind {
            IndexKind::Single => Ok(Self::Single(Single::new(desc)?)),
            IndexKind::Flat if R == 1 => Ok(Self::Flat(Flat::new(desc)?)),
            IndexKind::Flat => Err(IndexError::FlatRequiresRankOne { rank: R }),
            IndexKind::Strided => Ok(Self::Strided(Strided::new(desc)?)),
            IndexKind::StridedSequence => Err(IndexError::KindUnavailable { kind }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Single(_) => IndexKind::Single,
            Self::Flat(_) => IndexKind::Flat,
            Self::Strided(_) => IndexKind::Strided,
        }
    }
}

impl<const R: usize> IndexStrategy<R> for OperandIndex<R> {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool {
        match self {
            Self::Single(index) => index.is_in_bounds(position),
            Self::Flat(index) => position[0] < index.count,
            Self::Strided(index) => index.is_in_bounds(position),
        }
    }

    fn linear(&self, position: &Logical<R>) -> u32 {
        match self {
            Self::Single(index) => index.linear(position),
            Self::Flat(_) => position[0],
            Self::Strided(index) => index.linear(position),
        }
    }
}

/// Runtime choice of strategy for an output generated in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOperandIndex<const R: usize> {
    Single(Single<R>),
    Flat(Flat),
    StridedSeq(StridedSeq<R>),
}

impl<const R: usize> SequenceOperandIndex<R> {
    pub fn for_kind(desc: &TensorDescriptor, kind: IndexKind) -> Result<Self, IndexError> {
        match kind {
            IndexKind::Single => Ok(Self::Single(Single::new(desc)?)),
            IndexKind::Flat if R == 1 => Ok(Self::Flat(Flat::new(desc)?)),
            IndexKind::Flat => Err(IndexError::FlatRequiresRankOne { rank: R }),
            IndexKind::StridedSequence => Ok(Self::StridedSeq(StridedSeq::new(desc)?)),
            IndexKind::Strided => Err(IndexError::KindUnavailable { kind }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Single(_) => IndexKind::Single,
            Self::Flat(_) => IndexKind::Flat,
            Self::StridedSeq(_) => IndexKind::StridedSequence,
        }
    }
}

impl<const R: usize> IndexStrategy<R> for SequenceOperandIndex<R> {
    fn is_in_bounds(&self, position: &Logical<R>) -> bool {
        match self {
            Self::Single(index) => index.is_in_bounds(position),
            Self::Flat(index) => position[0] < index.count,
            Self::StridedSeq(index) => index.is_in_bounds(position),
        }
    }

    fn linear(&self, position: &Logical<R>) -> u32 {
        match self {
            Self::Single(index) => index.linear(position),
            Self::Flat(_) => position[0],
            Self::StridedSeq(index) => index.linear(position),
        }
    }
}

impl<const R: usize> SequenceIndex<R> for SequenceOperandIndex<R> {
    fn sequence(&self, position: &Logical<R>) -> u32 {
        match self {
            Self::Single(index) => index.sequence(position),
            Self::Flat(_) => position[0],
            Self::StridedSeq(index) => index.sequence(position),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    RankMismatch { expected: usize, actual: usize },
    DimensionOverflow { value: usize },
    NotDense { count: usize, span_count: usize },
    NotSingle { span_count: usize },
    FlatRequiresRankOne { rank: usize },
    KindUnavailable { kind: IndexKind },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch { expected, actual } => {
                write!(f, "index rank mismatch expected={expected}, actual={actual}")
            }
            Self::DimensionOverflow { value } => {
                write!(f, "dimension value {value} exceeds the 32-bit index range")
            }
            Self::NotDense { count, span_count } => write!(
                f,
                "flat indexing requires a dense tensor: count={count}, span_count={span_count}"
            ),
            Self::NotSingle { span_count } => {
                write!(f, "single indexing requires span_count=1, got {span_count}")
            }
            Self::FlatRequiresRankOne { rank } => {
                write!(f, "flat indexing is only launched at rank 1, not {rank}")
            }
            Self::KindUnavailable { kind } => {
                write!(f, "index kind {kind} is not valid for this operand role")
            }
        }
    }
}

impl std::error::Error for IndexError {}

/// Block shapes per launch rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TileConfig {
    /// Rank-1 block width once the element count reaches `flat_threshold`.
    pub flat_block: u32,
    pub small_flat_block: u32,
    pub flat_threshold: usize,
    /// `[x, y]`
    pub block2: [u32; 2],
    /// `[x, y, z]`
    pub block3: [u32; 3],
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            flat_block: 1024,
            small_flat_block: 32,
            flat_threshold: 1024,
            block2: [16, 16],
            block3: [16, 8, 8],
        }
    }
}

impl TileConfig {
    #[must_use]
    pub fn block_for(&self, shape: &[usize]) -> Dim3 {
        match shape {
            [count] if *count >= self.flat_threshold => Dim3::new(self.flat_block, 1, 1),
            [_] => Dim3::new(self.small_flat_block, 1, 1),
            [_, _] => Dim3::new(self.block2[0], self.block2[1], 1),
            _ => Dim3::new(self.block3[0], self.block3[1], self.block3[2]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
}

impl LaunchConfig {
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.grid.volume()
    }

    #[must_use]
    pub fn threads_per_block(&self) -> u64 {
        self.block.volume()
    }

    /// Block index for the `ordinal`-th block in x-fastest order.
    #[must_use]
    pub fn block_at(&self, ordinal: u64) -> Dim3 {
        let gx = u64::from(self.grid.x.max(1));
        let gy = u64::from(self.grid.y.max(1));
        Dim3 {
            x: (ordinal % gx) as u32,
            y: ((ordinal / gx) % gy) as u32,
            z: (ordinal / (gx * gy)) as u32,
        }
    }

    /// Every thread coordinate of one block, x fastest.
    pub fn threads_of(&self, block_idx: Dim3) -> impl Iterator<Item = GridCoord> + '_ {
        let block = self.block;
        (0..block.z).flat_map(move |z| {
            (0..block.y).flat_map(move |y| {
                (0..block.x).map(move |x| GridCoord {
                    block_idx,
                    block_dim: block,
                    thread_idx: Dim3::new(x, y, z),
                })
            })
        })
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={} block={}", self.grid, self.block)
    }
}

fn div_up(extent: usize, block: u32) -> u64 {
    let block = u64::from(block);
    (extent as u64).div_ceil(block)
}

/// Grid that assigns one thread to every logical element of `shape`.
///
/// Axis `R-1` runs along grid x, axis `R-2` along y and axis `R-3` along z,
/// matching [`Logical::from_grid`].
pub fn launch_config(shape: &[usize], tile: &TileConfig) -> Result<LaunchConfig, LaunchError> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(LaunchError::UnsupportedRank { rank: shape.len() });
    }

    let block = tile.block_for(shape);
    let threads = block.volume();
    if threads == 0 {
        return Err(LaunchError::EmptyBlock { block });
    }
    if threads > u64::from(MAX_BLOCK_THREADS) || block.z > MAX_BLOCK_Z {
        return Err(LaunchError::BlockTooLarge { block });
    }

    let mut grid = Dim3::new(1, 1, 1);
    let extents = [block.x, block.y, block.z];
    let limits = [MAX_GRID_X, MAX_GRID_YZ, MAX_GRID_YZ];
    for (lane, axis) in (0..shape.len()).rev().enumerate() {
        let blocks = div_up(shape[axis], extents[lane]);
        if blocks > u64::from(limits[lane]) {
            return Err(LaunchError::GridTooLarge {
                axis: ['x', 'y', 'z'][lane],
                blocks,
                limit: limits[lane],
            });
        }
        let blocks = blocks as u32;
        match lane {
            0 => grid.x = blocks,
            1 => grid.y = blocks,
            _ => grid.z = blocks,
        }
    }
    Ok(LaunchConfig { grid, block })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    UnsupportedRank { rank: usize },
    EmptyBlock { block: Dim3 },
    BlockTooLarge { block: Dim3 },
    GridTooLarge { axis: char, blocks: u64, limit: u32 },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRank { rank } => write!(f, "no launch geometry for rank {rank}"),
            Self::EmptyBlock { block } => write!(f, "block {block} has no threads"),
            Self::BlockTooLarge { block } => write!(
                f,
                "block {block} exceeds {MAX_BLOCK_THREADS} threads or z extent {MAX_BLOCK_Z}"
            ),
            Self::GridTooLarge {
                axis,
                blocks,
                limit,
            } => write!(f, "grid {axis} needs {blocks} blocks, limit is {limit}"),
        }
    }
}

impl std::error::Error for LaunchError {}
