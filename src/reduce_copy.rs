//! Alignment-aware vectorized reduce/copy engine.
//!
//! [`reduce_or_copy`] computes `dest0[i] = F(src0[i], src1[i])` (or a plain
//! copy of `src0` when there is no second source) and optionally mirrors the
//! result into `dest1`. The work is split across `THREADS` cooperating lanes;
//! each call handles the indices owned by one lane (`tid`), and every lane must
//! be invoked with the same operands and `n` for the block to be complete.
//!
//! # Stages
//!
//! 1. **Preamble**: element-wise processing of the leading elements until
//!    `dest0` reaches [`PACK_ALIGN`]. If any other operand is not aligned at
//!    that same index, the preamble covers the entire range and the call never
//!    vectorizes.
//! 2. **Fast path**: the aligned middle is reinterpreted as [`PackType`] units.
//!    A main loop moves `UNROLL` packs per lane per iteration, a second loop
//!    moves the remaining whole packs one at a time, and a scalar tail handles
//!    the elements that do not fill a pack.
//!
//! Results are written straight into the destinations by every stage. The
//! engine does no synchronization; callers make sure sources are complete and
//! destinations are free before any lane starts.

use std::marker::PhantomData;

use crate::datatype::Element;
use crate::error::{Error, Result};
use crate::reduce::{
    pack_factor, reduce_pack, FuncMax, FuncMin, FuncProd, FuncSum, PackType, ReduceFunc,
    PACK_ALIGN,
};
use crate::ReduceOp;

/// Default unroll factor of the main fast-path loop.
pub const DEFAULT_UNROLL: usize = 8;

/// Default number of cooperating lanes.
pub const DEFAULT_THREADS: usize = 64;

/// Source and destination buffers for one reduce/copy invocation.
///
/// All buffers must hold at least `n` elements for the `n` passed to the
/// engine. Sources and destinations may not overlap.
pub struct Operands<'a, T: Element> {
    /// Primary destination.
    pub dest0: &'a mut [T],
    /// Optional mirror of `dest0`.
    pub dest1: Option<&'a mut [T]>,
    /// Primary source.
    pub src0: &'a [T],
    /// Optional second source; its presence turns the copy into a reduction.
    pub src1: Option<&'a [T]>,
}

impl<'a, T: Element> Operands<'a, T> {
    /// Plain copy `dest0 = src0`.
    pub fn copy(dest0: &'a mut [T], src0: &'a [T]) -> Self {
        Operands {
            dest0,
            dest1: None,
            src0,
            src1: None,
        }
    }

    /// Reduction `dest0 = F(src0, src1)`.
    pub fn reduce(dest0: &'a mut [T], src0: &'a [T], src1: &'a [T]) -> Self {
        Operands {
            dest0,
            dest1: None,
            src0,
            src1: Some(src1),
        }
    }

    /// Also write every result into `dest1`.
    #[must_use]
    pub fn mirror_into(mut self, dest1: &'a mut [T]) -> Self {
        self.dest1 = Some(dest1);
        self
    }

    fn check_len(&self, n: usize) -> Result<()> {
        let short = self.dest0.len() < n
            || self.src0.len() < n
            || self.src1.is_some_and(|s| s.len() < n)
            || self.dest1.as_ref().is_some_and(|d| d.len() < n);
        if short {
            Err(Error::InvalidBuffer)
        } else {
            Ok(())
        }
    }
}

/// How one invocation splits between the scalar preamble and the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePlan {
    /// Leading elements processed one at a time.
    pub preamble: usize,
    /// Whether the remainder runs on the packed fast path.
    pub alignable: bool,
}

/// Elements from the start of `s` to the first pack-aligned address, or
/// `None` when no element boundary lands on one.
fn align_gap<T>(s: &[T]) -> Option<usize> {
    let size = std::mem::size_of::<T>();
    let bytes = (PACK_ALIGN - s.as_ptr() as usize % PACK_ALIGN) % PACK_ALIGN;
    (bytes % size == 0).then_some(bytes / size)
}

fn aligned_at<T>(s: &[T], idx: usize) -> bool {
    (s.as_ptr() as usize + idx * std::mem::size_of::<T>()) % PACK_ALIGN == 0
}

/// Decide the preamble length and whether the fast path can be used.
///
/// Requires `n > 0` and operands at least `n` long.
pub fn plan<T: Element>(ops: &Operands<'_, T>, n: usize) -> LanePlan {
    let gap = if n < PACK_ALIGN {
        Some(n)
    } else {
        align_gap(ops.dest0)
    };
    let Some(preamble) = gap else {
        return LanePlan {
            preamble: n,
            alignable: false,
        };
    };

    let alignable = aligned_at(ops.dest0, preamble)
        && aligned_at(ops.src0, preamble)
        && ops.src1.map_or(true, |s| aligned_at(s, preamble))
        && ops.dest1.as_ref().map_or(true, |d| aligned_at(d, preamble));

    if alignable {
        LanePlan {
            preamble,
            alignable,
        }
    } else {
        LanePlan {
            preamble: n,
            alignable,
        }
    }
}

#[inline]
fn reduce_copy_one<F: ReduceFunc, T: Element>(ops: &mut Operands<'_, T>, idx: usize) {
    let mut val = ops.src0[idx];
    if let Some(src1) = ops.src1 {
        val = F::apply(val, src1[idx]);
    }
    ops.dest0[idx] = val;
    if let Some(dest1) = ops.dest1.as_deref_mut() {
        dest1[idx] = val;
    }
}

fn as_packs<T: Element>(s: &[T]) -> Result<&[PackType]> {
    bytemuck::try_cast_slice(s).map_err(|e| Error::Internal(format!("pack view: {e:?}")))
}

fn as_packs_mut<T: Element>(s: &mut [T]) -> Result<&mut [PackType]> {
    bytemuck::try_cast_slice_mut(s).map_err(|e| Error::Internal(format!("pack view: {e:?}")))
}

/// The aligned middle of the operands, viewed as packs.
struct PackView<'b, T> {
    src0: &'b [PackType],
    src1: Option<&'b [PackType]>,
    dest0: &'b mut [PackType],
    dest1: Option<&'b mut [PackType]>,
    _elem: PhantomData<T>,
}

impl<'b, T: Element> PackView<'b, T> {
    fn new(ops: &'b mut Operands<'_, T>, start: usize, npacks: usize) -> Result<Self> {
        let end = start + npacks * pack_factor::<T>();
        Ok(PackView {
            src0: as_packs(&ops.src0[start..end])?,
            src1: ops.src1.map(|s| as_packs(&s[start..end])).transpose()?,
            dest0: as_packs_mut(&mut ops.dest0[start..end])?,
            dest1: ops
                .dest1
                .as_deref_mut()
                .map(|d| as_packs_mut(&mut d[start..end]))
                .transpose()?,
            _elem: PhantomData,
        })
    }

    /// Move `U` packs at `offset`, `offset + stride`, ... Loads all of them
    /// before storing any.
    #[inline]
    fn copy_block<F: ReduceFunc, const U: usize>(&mut self, offset: usize, stride: usize) {
        let mut t0: [PackType; U] = [0; U];
        let mut t1: [PackType; U] = [0; U];
        for u in 0..U {
            let idx = offset + u * stride;
            t0[u] = self.src0[idx];
            if let Some(src1) = self.src1 {
                t1[u] = src1[idx];
            }
        }
        for u in 0..U {
            let idx = offset + u * stride;
            let val = if self.src1.is_some() {
                reduce_pack::<F, T>(t0[u], t1[u])
            } else {
                t0[u]
            };
            self.dest0[idx] = val;
            if let Some(dest1) = self.dest1.as_deref_mut() {
                dest1[idx] = val;
            }
        }
    }
}

/// Run lane `tid` of a `THREADS`-lane reduce/copy over the first `n` elements.
///
/// `F` is ignored when `ops.src1` is `None`. `n == 0` is a no-op.
///
/// # Panics
///
/// Panics if `UNROLL` or `THREADS` is zero or `tid >= THREADS`.
pub fn reduce_or_copy<const UNROLL: usize, const THREADS: usize, F: ReduceFunc, T: Element>(
    tid: usize,
    ops: &mut Operands<'_, T>,
    n: usize,
) -> Result<()> {
    assert!(UNROLL > 0 && THREADS > 0, "UNROLL and THREADS must be non-zero");
    assert!(tid < THREADS, "lane {tid} out of range for {THREADS} lanes");
    if n == 0 {
        return Ok(());
    }
    ops.check_len(n)?;

    let LanePlan {
        preamble,
        alignable,
    } = plan(ops, n);

    // Stage 1: only more than one iteration per lane when not alignable.
    for idx in (tid..preamble).step_by(THREADS) {
        reduce_copy_one::<F, T>(ops, idx);
    }
    if !alignable {
        return Ok(());
    }

    // Stage 2: packed fast path.
    let pf = pack_factor::<T>();
    let rem = n - preamble;
    let packs_main = (rem / (pf * UNROLL * THREADS)) * (UNROLL * THREADS);
    let packs_total = packs_main + (rem - packs_main * pf) / pf;

    {
        let mut packs = PackView::<T>::new(ops, preamble, packs_total)?;

        // 2a: UNROLL packs per lane per iteration.
        let mut idx = tid;
        while idx < packs_main {
            packs.copy_block::<F, UNROLL>(idx, THREADS);
            idx += UNROLL * THREADS;
        }

        // 2b: whole packs that do not fill an unrolled group.
        let mut idx = packs_main + tid;
        while idx < packs_total {
            packs.copy_block::<F, 1>(idx, 0);
            idx += THREADS;
        }
    }

    // 2c: scalar tail, at most pf - 1 elements.
    let done = preamble + packs_total * pf;
    for idx in (done + tid..n).step_by(THREADS) {
        reduce_copy_one::<F, T>(ops, idx);
    }
    Ok(())
}

/// Run every lane of the block in turn.
pub fn run_all_lanes<const UNROLL: usize, const THREADS: usize, F: ReduceFunc, T: Element>(
    ops: &mut Operands<'_, T>,
    n: usize,
) -> Result<()> {
    for tid in 0..THREADS {
        reduce_or_copy::<UNROLL, THREADS, F, T>(tid, ops, n)?;
    }
    Ok(())
}

/// [`reduce_or_copy`] with the functor chosen from a runtime [`ReduceOp`].
pub fn reduce_or_copy_op<const UNROLL: usize, const THREADS: usize, T: Element>(
    tid: usize,
    op: ReduceOp,
    ops: &mut Operands<'_, T>,
    n: usize,
) -> Result<()> {
    match op {
        ReduceOp::Sum => reduce_or_copy::<UNROLL, THREADS, FuncSum, T>(tid, ops, n),
        ReduceOp::Prod => reduce_or_copy::<UNROLL, THREADS, FuncProd, T>(tid, ops, n),
        ReduceOp::Max => reduce_or_copy::<UNROLL, THREADS, FuncMax, T>(tid, ops, n),
        ReduceOp::Min => reduce_or_copy::<UNROLL, THREADS, FuncMin, T>(tid, ops, n),
    }
}

/// [`run_all_lanes`] with the functor chosen from a runtime [`ReduceOp`].
pub fn run_all_lanes_op<const UNROLL: usize, const THREADS: usize, T: Element>(
    op: ReduceOp,
    ops: &mut Operands<'_, T>,
    n: usize,
) -> Result<()> {
    for tid in 0..THREADS {
        reduce_or_copy_op::<UNROLL, THREADS, T>(tid, op, ops, n)?;
    }
    Ok(())
}

/// Reduce `src0` and `src1` into `dest` with the default lane geometry.
pub fn reduce_slices<T: Element>(op: ReduceOp, dest: &mut [T], src0: &[T], src1: &[T]) -> Result<()> {
    let n = dest.len();
    run_all_lanes_op::<DEFAULT_UNROLL, DEFAULT_THREADS, T>(
        op,
        &mut Operands::reduce(dest, src0, src1),
        n,
    )
}

/// Copy `src` into `dest` with the default lane geometry.
pub fn copy_slices<T: Element>(dest: &mut [T], src: &[T]) -> Result<()> {
    let n = dest.len();
    run_all_lanes::<DEFAULT_UNROLL, DEFAULT_THREADS, FuncSum, T>(&mut Operands::copy(dest, src), n)
}
