//! Reduction functors and per-type pack combination.
//!
//! A [`PackType`] is a 64-bit container holding `8 / size_of::<T>()` logical
//! elements laid out exactly as they sit in memory. [`reduce_pack`] splits two
//! packs into lanes, applies a [`ReduceFunc`] lane by lane and repacks. The
//! lane count is a constant of the element type, so the whole combine
//! monomorphizes to straight-line code per `(functor, type)` pair.

use crate::datatype::Element;
use crate::ReduceOp;

/// Fixed-width container moved by one vectorized load or store.
pub type PackType = u64;

/// Size of a [`PackType`] in bytes.
pub const PACK_BYTES: usize = std::mem::size_of::<PackType>();

/// Required address alignment for [`PackType`] access.
pub const PACK_ALIGN: usize = std::mem::align_of::<PackType>();

/// Number of `T` elements carried by one pack.
#[inline]
pub const fn pack_factor<T: Element>() -> usize {
    PACK_BYTES / std::mem::size_of::<T>()
}

/// A binary reduction applied element by element.
pub trait ReduceFunc: Copy + Default + Send + Sync + 'static {
    /// The runtime operator this functor implements.
    const OP: ReduceOp;

    /// Combine two elements.
    fn apply<T: Element>(a: T, b: T) -> T;
}

/// `a + b`
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncSum;

/// `a * b`
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncProd;

/// `max(a, b)`
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncMax;

/// `min(a, b)`
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncMin;

impl ReduceFunc for FuncSum {
    const OP: ReduceOp = ReduceOp::Sum;

    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        T::sum(a, b)
    }
}

impl ReduceFunc for FuncProd {
    const OP: ReduceOp = ReduceOp::Prod;

    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        T::prod(a, b)
    }
}

impl ReduceFunc for FuncMax {
    const OP: ReduceOp = ReduceOp::Max;

    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        T::max(a, b)
    }
}

impl ReduceFunc for FuncMin {
    const OP: ReduceOp = ReduceOp::Min;

    #[inline]
    fn apply<T: Element>(a: T, b: T) -> T {
        T::min(a, b)
    }
}

#[inline]
const fn lane_mask<T: Element>() -> u64 {
    if T::BITS >= 64 {
        u64::MAX
    } else {
        (1u64 << T::BITS) - 1
    }
}

/// Extract lane `lane` of `pack` as a `T`.
///
/// Lane `i` is the element at byte offset `i * size_of::<T>()` of the pack in
/// memory. Requires `lane < pack_factor::<T>()`.
#[inline]
pub fn unpack_lane<T: Element>(pack: PackType, lane: usize) -> T {
    debug_assert!(lane < pack_factor::<T>());
    T::from_bits((pack >> lane_shift::<T>(lane)) & lane_mask::<T>())
}

/// Return `pack` with lane `lane` replaced by `value`.
///
/// Requires `lane < pack_factor::<T>()`. Other lanes are unchanged.
#[inline]
pub fn pack_lane<T: Element>(pack: PackType, lane: usize, value: T) -> PackType {
    debug_assert!(lane < pack_factor::<T>());
    let shift = lane_shift::<T>(lane);
    (pack & !(lane_mask::<T>() << shift)) | ((value.to_bits() & lane_mask::<T>()) << shift)
}

// Memory order to register order: packs are loaded with native endianness.
#[inline]
fn lane_shift<T: Element>(lane: usize) -> u32 {
    let lane = if cfg!(target_endian = "little") {
        lane
    } else {
        pack_factor::<T>() - 1 - lane
    };
    lane as u32 * T::BITS
}

/// Apply `F` lane-wise to two packs of `T`.
#[inline]
pub fn reduce_pack<F: ReduceFunc, T: Element>(x: PackType, y: PackType) -> PackType {
    let mut out: PackType = 0;
    for lane in 0..pack_factor::<T>() {
        let r = F::apply(unpack_lane::<T>(x, lane), unpack_lane::<T>(y, lane));
        out = pack_lane(out, lane, r);
    }
    out
}

/// Apply a runtime [`ReduceOp`] to two elements.
pub fn apply_op<T: Element>(op: ReduceOp, a: T, b: T) -> T {
    match op {
        ReduceOp::Sum => FuncSum::apply(a, b),
        ReduceOp::Prod => FuncProd::apply(a, b),
        ReduceOp::Max => FuncMax::apply(a, b),
        ReduceOp::Min => FuncMin::apply(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn pack_of<T: Element>(values: &[T]) -> PackType {
        let mut bytes = [0u8; PACK_BYTES];
        bytes.copy_from_slice(bytemuck::cast_slice(values));
        PackType::from_ne_bytes(bytes)
    }

    #[test]
    fn pack_factors() {
        assert_eq!(pack_factor::<i8>(), 8);
        assert_eq!(pack_factor::<u8>(), 8);
        assert_eq!(pack_factor::<f16>(), 4);
        assert_eq!(pack_factor::<i32>(), 2);
        assert_eq!(pack_factor::<f32>(), 2);
        assert_eq!(pack_factor::<u64>(), 1);
        assert_eq!(pack_factor::<f64>(), 1);
    }

    #[test]
    fn lanes_follow_memory_order() {
        let pack = pack_of(&[1u32, 2u32]);
        assert_eq!(unpack_lane::<u32>(pack, 0), 1);
        assert_eq!(unpack_lane::<u32>(pack, 1), 2);

        let replaced = pack_lane(pack, 1, 7u32);
        assert_eq!(replaced, pack_of(&[1u32, 7u32]));
    }

    #[test]
    fn byte_lanes_do_not_carry() {
        let x = pack_of(&[255u8, 1, 2, 3, 4, 5, 6, 7]);
        let y = pack_of(&[1u8, 1, 1, 1, 1, 1, 1, 1]);
        let r = reduce_pack::<FuncSum, u8>(x, y);
        assert_eq!(r, pack_of(&[0u8, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn signed_lanes() {
        let x = pack_of(&[-5i8, 3, -1, 0, 100, -100, 7, 8]);
        let y = pack_of(&[4i8, -3, -2, 9, -101, 99, 7, -8]);
        assert_eq!(
            reduce_pack::<FuncMax, i8>(x, y),
            pack_of(&[4i8, 3, -1, 9, 100, 99, 7, 8])
        );
        assert_eq!(
            reduce_pack::<FuncMin, i8>(x, y),
            pack_of(&[-5i8, -3, -2, 0, -101, -100, 7, -8])
        );
    }

    #[test]
    fn float_lanes() {
        let x = pack_of(&[1.5f32, -2.0]);
        let y = pack_of(&[2.0f32, 4.0]);
        assert_eq!(reduce_pack::<FuncProd, f32>(x, y), pack_of(&[3.0f32, -8.0]));

        let h = |v: f32| f16::from_f32(v);
        let x = pack_of(&[h(1.0), h(2.0), h(-3.0), h(0.5)]);
        let y = pack_of(&[h(1.0), h(0.5), h(3.0), h(0.25)]);
        assert_eq!(
            reduce_pack::<FuncSum, f16>(x, y),
            pack_of(&[h(2.0), h(2.5), h(0.0), h(0.75)])
        );
    }

    #[test]
    fn single_lane_types() {
        let r = reduce_pack::<FuncSum, f64>(2.5f64.to_bits(), 0.25f64.to_bits());
        assert_eq!(f64::from_bits(r), 2.75);
        let r = reduce_pack::<FuncMin, i64>((-4i64) as u64, 3i64 as u64);
        assert_eq!(r as i64, -4);
    }

    #[test]
    fn runtime_dispatch_matches_functors() {
        assert_eq!(apply_op(ReduceOp::Sum, 3i32, 4), 7);
        assert_eq!(apply_op(ReduceOp::Prod, 3i32, 4), 12);
        assert_eq!(apply_op(ReduceOp::Max, 3i32, 4), 4);
        assert_eq!(apply_op(ReduceOp::Min, 3i32, 4), 3);
        assert_eq!(FuncSum::OP, ReduceOp::Sum);
        assert_eq!(FuncMin::OP, ReduceOp::Min);
    }
}
