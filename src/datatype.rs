//! Element types accepted by the reduce/copy engine.
//!
//! This module provides the [`Element`] trait, a sealed trait that maps Rust
//! primitive types to datatype tags and defines how each type is moved in and
//! out of a 64-bit [`PackType`](crate::reduce::PackType) lane.
//!
//! # Supported Types
//!
//! | Rust Type  | Tag Value | Elements per pack |
//! |------------|-----------|-------------------|
//! | `i8`       | 0         | 8                 |
//! | `u8`       | 1         | 8                 |
//! | `i32`      | 2         | 2                 |
//! | `u32`      | 3         | 2                 |
//! | `i64`      | 4         | 1                 |
//! | `u64`      | 5         | 1                 |
//! | `f16`      | 6         | 4                 |
//! | `f32`      | 7         | 2                 |
//! | `f64`      | 8         | 1                 |

use half::f16;

/// Seals [`Element`] to the types below.
mod sealed {
    pub trait Sealed {}
}

/// Wire tag for each element type.
///
/// The discriminants follow the collective API's datatype numbering and must
/// not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ElementTag {
    /// 8-bit signed integer
    I8 = 0,
    /// 8-bit unsigned integer
    U8 = 1,
    /// 32-bit signed integer
    I32 = 2,
    /// 32-bit unsigned integer
    U32 = 3,
    /// 64-bit signed integer
    I64 = 4,
    /// 64-bit unsigned integer
    U64 = 5,
    /// IEEE 754 half precision
    F16 = 6,
    /// 32-bit floating point
    F32 = 7,
    /// 64-bit floating point
    F64 = 8,
}

/// Trait for types the reduce/copy engine can combine.
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
///
/// # Bit reinterpretation
///
/// [`to_bits`](Element::to_bits) returns the element's raw bit pattern in the
/// low `8 * size_of::<Self>()` bits of a `u64`, upper bits zero.
/// [`from_bits`](Element::from_bits) is its inverse and ignores any bits above
/// the element width. No numeric conversion happens in either direction.
///
/// # Arithmetic
///
/// Integer sums and products wrap, matching native device arithmetic. Float
/// max/min return the first operand when the comparison is unordered.
pub trait Element: sealed::Sealed + bytemuck::Pod + PartialEq + Send + Sync + 'static {
    /// The datatype tag for this element type.
    const TAG: ElementTag;

    /// Width of one element in bits.
    const BITS: u32 = (std::mem::size_of::<Self>() * 8) as u32;

    /// Raw bits of `self`, zero-extended to 64 bits.
    fn to_bits(self) -> u64;

    /// Element from the low [`BITS`](Element::BITS) bits of `bits`.
    fn from_bits(bits: u64) -> Self;

    /// `a + b` with the type's native arithmetic.
    fn sum(a: Self, b: Self) -> Self;

    /// `a * b` with the type's native arithmetic.
    fn prod(a: Self, b: Self) -> Self;

    /// The larger of `a` and `b`.
    fn max(a: Self, b: Self) -> Self;

    /// The smaller of `a` and `b`.
    fn min(a: Self, b: Self) -> Self;
}

fn pick_max<T: PartialOrd>(a: T, b: T) -> T {
    if b > a {
        b
    } else {
        a
    }
}

fn pick_min<T: PartialOrd>(a: T, b: T) -> T {
    if b < a {
        b
    } else {
        a
    }
}

macro_rules! impl_int_element {
    ($ty:ty, $uty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Element for $ty {
            const TAG: ElementTag = $tag;

            #[inline]
            fn to_bits(self) -> u64 {
                u64::from(self as $uty)
            }

            #[inline]
            fn from_bits(bits: u64) -> Self {
                bits as $uty as $ty
            }

            #[inline]
            fn sum(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }

            #[inline]
            fn prod(a: Self, b: Self) -> Self {
                a.wrapping_mul(b)
            }

            #[inline]
            fn max(a: Self, b: Self) -> Self {
                Ord::max(a, b)
            }

            #[inline]
            fn min(a: Self, b: Self) -> Self {
                Ord::min(a, b)
            }
        }
    };
}

macro_rules! impl_float_element {
    ($ty:ty, $uty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Element for $ty {
            const TAG: ElementTag = $tag;

            #[inline]
            fn to_bits(self) -> u64 {
                u64::from(<$ty>::to_bits(self))
            }

            #[inline]
            fn from_bits(bits: u64) -> Self {
                <$ty>::from_bits(bits as $uty)
            }

            #[inline]
            fn sum(a: Self, b: Self) -> Self {
                a + b
            }

            #[inline]
            fn prod(a: Self, b: Self) -> Self {
                a * b
            }

            #[inline]
            fn max(a: Self, b: Self) -> Self {
                pick_max(a, b)
            }

            #[inline]
            fn min(a: Self, b: Self) -> Self {
                pick_min(a, b)
            }
        }
    };
}

impl_int_element!(i8, u8, ElementTag::I8);
impl_int_element!(u8, u8, ElementTag::U8);
impl_int_element!(i32, u32, ElementTag::I32);
impl_int_element!(u32, u32, ElementTag::U32);
impl_int_element!(i64, u64, ElementTag::I64);
impl_int_element!(u64, u64, ElementTag::U64);
impl_float_element!(f32, u32, ElementTag::F32);
impl_float_element!(f64, u64, ElementTag::F64);

// f16 arithmetic goes through f32 and rounds back once per operation.
impl sealed::Sealed for f16 {}
impl Element for f16 {
    const TAG: ElementTag = ElementTag::F16;

    #[inline]
    fn to_bits(self) -> u64 {
        u64::from(f16::to_bits(self))
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        f16::from_bits(bits as u16)
    }

    #[inline]
    fn sum(a: Self, b: Self) -> Self {
        f16::from_f32(a.to_f32() + b.to_f32())
    }

    #[inline]
    fn prod(a: Self, b: Self) -> Self {
        f16::from_f32(a.to_f32() * b.to_f32())
    }

    #[inline]
    fn max(a: Self, b: Self) -> Self {
        pick_max(a, b)
    }

    #[inline]
    fn min(a: Self, b: Self) -> Self {
        pick_min(a, b)
    }
}
