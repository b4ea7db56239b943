//! Element datatypes and reduction operators understood by the transport.
//!
//! Collectives and atomics operate on raw byte buffers tagged with a
//! [DartDatatype]; the kernels in this module interpret those buffers.

use crate::error::{DartError, DartResult};

use serde::{Deserialize, Serialize};
use std::mem::size_of;

/// The fixed table of element types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DartDatatype {
    Byte,
    Char,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    /// `(f32, i32)` pair used by MINLOC/MAXLOC
    FloatInt,
    /// `(f64, i32)` pair used by MINLOC/MAXLOC
    DoubleInt,
    /// `(i64, i32)` pair used by MINLOC/MAXLOC
    LongInt,
}

impl DartDatatype {
    /// Size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            DartDatatype::Byte | DartDatatype::Char => 1,
            DartDatatype::Short | DartDatatype::UShort => 2,
            DartDatatype::Int | DartDatatype::UInt | DartDatatype::Float => 4,
            DartDatatype::Long | DartDatatype::ULong | DartDatatype::Double => 8,
            DartDatatype::FloatInt => size_of::<ValueLoc<f32>>(),
            DartDatatype::DoubleInt => size_of::<ValueLoc<f64>>(),
            DartDatatype::LongInt => size_of::<ValueLoc<i64>>(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DartDatatype::Float | DartDatatype::Double)
    }

    pub fn is_pair(&self) -> bool {
        matches!(
            self,
            DartDatatype::FloatInt | DartDatatype::DoubleInt | DartDatatype::LongInt
        )
    }
}

/// Reduction and accumulation operators
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DartOp {
    Min,
    Max,
    /// Element pairs `[min, max]` reduced to the global minimum and maximum
    MinMax,
    Sum,
    Prod,
    Band,
    Bor,
    Bxor,
    Land,
    Lor,
    Lxor,
    MinLoc,
    MaxLoc,
    /// Overwrite the target with the operand
    Replace,
    /// Leave the target untouched, used for atomic loads
    NoOp,
}

/// A value together with its location, the element of the pair datatypes
#[repr(C)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct ValueLoc<T> {
    pub value: T,
    pub loc: i32,
}

/// Rust types with an entry in the datatype table
pub trait DartType: Copy + Send + Sync + Default + std::fmt::Debug + 'static {
    const DATATYPE: DartDatatype;
}

macro_rules! impl_dart_type {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(
            impl DartType for $t {
                const DATATYPE: DartDatatype = DartDatatype::$dt;
            }
        )*
    };
}

impl_dart_type!(
    u8 => Byte,
    i8 => Char,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    isize => Long,
    usize => ULong,
    f32 => Float,
    f64 => Double,
    ValueLoc<f32> => FloatInt,
    ValueLoc<f64> => DoubleInt,
    ValueLoc<i64> => LongInt,
);

/// View a slice of plain values as bytes
pub(crate) fn as_bytes<T: DartType>(vals: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(vals.as_ptr() as *const u8, std::mem::size_of_val(vals)) }
}

/// View a mutable slice of plain values as bytes
pub(crate) fn as_bytes_mut<T: DartType>(vals: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(vals.as_mut_ptr() as *mut u8, std::mem::size_of_val(vals))
    }
}

/// Reassemble plain values from bytes of matching length
pub(crate) fn from_bytes<T: DartType>(bytes: &[u8]) -> Vec<T> {
    let n = bytes.len() / size_of::<T>();
    (0..n).map(|i| read::<T>(bytes, i)).collect()
}

fn read<T: Copy>(buf: &[u8], i: usize) -> T {
    debug_assert!((i + 1) * size_of::<T>() <= buf.len());
    unsafe { std::ptr::read_unaligned(buf.as_ptr().add(i * size_of::<T>()) as *const T) }
}

fn write<T: Copy>(buf: &mut [u8], i: usize, val: T) {
    debug_assert!((i + 1) * size_of::<T>() <= buf.len());
    unsafe { std::ptr::write_unaligned(buf.as_mut_ptr().add(i * size_of::<T>()) as *mut T, val) }
}

trait Element: Copy + PartialOrd {
    fn add(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn bitwise(self, _other: Self, _op: DartOp) -> DartResult<Self> {
        Err(DartError::Inval)
    }
    fn truthy(self) -> bool;
    fn from_bool(b: bool) -> Self;
}

macro_rules! impl_int_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                fn add(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }
                fn mul(self, other: Self) -> Self {
                    self.wrapping_mul(other)
                }
                fn bitwise(self, other: Self, op: DartOp) -> DartResult<Self> {
                    match op {
                        DartOp::Band => Ok(self & other),
                        DartOp::Bor => Ok(self | other),
                        DartOp::Bxor => Ok(self ^ other),
                        _ => Err(DartError::Inval),
                    }
                }
                fn truthy(self) -> bool {
                    self != 0
                }
                fn from_bool(b: bool) -> Self {
                    b as $t
                }
            }
        )*
    };
}

macro_rules! impl_float_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                fn add(self, other: Self) -> Self {
                    self + other
                }
                fn mul(self, other: Self) -> Self {
                    self * other
                }
                fn truthy(self) -> bool {
                    self != 0.0
                }
                fn from_bool(b: bool) -> Self {
                    if b {
                        1.0
                    } else {
                        0.0
                    }
                }
            }
        )*
    };
}

impl_int_element!(u8, i8, i16, u16, i32, u32, i64, u64);
impl_float_element!(f32, f64);

fn combine<T: Element>(op: DartOp, a: T, b: T) -> DartResult<T> {
    let res = match op {
        DartOp::Min => {
            if b < a {
                b
            } else {
                a
            }
        }
        DartOp::Max => {
            if b > a {
                b
            } else {
                a
            }
        }
        DartOp::Sum => a.add(b),
        DartOp::Prod => a.mul(b),
        DartOp::Band | DartOp::Bor | DartOp::Bxor => a.bitwise(b, op)?,
        DartOp::Land => T::from_bool(a.truthy() && b.truthy()),
        DartOp::Lor => T::from_bool(a.truthy() || b.truthy()),
        DartOp::Lxor => T::from_bool(a.truthy() != b.truthy()),
        DartOp::Replace => b,
        DartOp::NoOp => a,
        DartOp::MinMax | DartOp::MinLoc | DartOp::MaxLoc => return Err(DartError::Inval),
    };
    Ok(res)
}

fn reduce_typed<T: Element>(op: DartOp, acc: &mut [u8], src: &[u8]) -> DartResult<()> {
    let n = acc.len() / size_of::<T>();
    if op == DartOp::MinMax {
        if n % 2 != 0 {
            return Err(DartError::Inval);
        }
        for k in (0..n).step_by(2) {
            let min = combine(DartOp::Min, read::<T>(acc, k), read::<T>(src, k))?;
            let max = combine(DartOp::Max, read::<T>(acc, k + 1), read::<T>(src, k + 1))?;
            write(acc, k, min);
            write(acc, k + 1, max);
        }
        return Ok(());
    }
    for i in 0..n {
        let val = combine(op, read::<T>(acc, i), read::<T>(src, i))?;
        write(acc, i, val);
    }
    Ok(())
}

fn reduce_loc<T: Copy + PartialOrd>(op: DartOp, acc: &mut [u8], src: &[u8]) -> DartResult<()> {
    let n = acc.len() / size_of::<ValueLoc<T>>();
    for i in 0..n {
        let a = read::<ValueLoc<T>>(acc, i);
        let b = read::<ValueLoc<T>>(src, i);
        let take_b = match op {
            DartOp::MinLoc => b.value < a.value || (b.value == a.value && b.loc < a.loc),
            DartOp::MaxLoc => b.value > a.value || (b.value == a.value && b.loc < a.loc),
            DartOp::Replace => true,
            DartOp::NoOp => false,
            _ => return Err(DartError::Inval),
        };
        if take_b {
            write(acc, i, b);
        }
    }
    Ok(())
}

/// Combine `src` into `acc` element-wise: `acc[i] = op(acc[i], src[i])`
pub(crate) fn reduce_bytes(
    op: DartOp,
    dtype: DartDatatype,
    acc: &mut [u8],
    src: &[u8],
) -> DartResult<()> {
    if acc.len() != src.len() || acc.len() % dtype.size() != 0 {
        return Err(DartError::Inval);
    }
    if matches!(op, DartOp::MinLoc | DartOp::MaxLoc) != dtype.is_pair()
        && !matches!(op, DartOp::Replace | DartOp::NoOp)
    {
        return Err(DartError::Inval);
    }
    match dtype {
        DartDatatype::Byte => reduce_typed::<u8>(op, acc, src),
        DartDatatype::Char => reduce_typed::<i8>(op, acc, src),
        DartDatatype::Short => reduce_typed::<i16>(op, acc, src),
        DartDatatype::UShort => reduce_typed::<u16>(op, acc, src),
        DartDatatype::Int => reduce_typed::<i32>(op, acc, src),
        DartDatatype::UInt => reduce_typed::<u32>(op, acc, src),
        DartDatatype::Long => reduce_typed::<i64>(op, acc, src),
        DartDatatype::ULong => reduce_typed::<u64>(op, acc, src),
        DartDatatype::Float => reduce_typed::<f32>(op, acc, src),
        DartDatatype::Double => reduce_typed::<f64>(op, acc, src),
        DartDatatype::FloatInt => reduce_loc::<f32>(op, acc, src),
        DartDatatype::DoubleInt => reduce_loc::<f64>(op, acc, src),
        DartDatatype::LongInt => reduce_loc::<i64>(op, acc, src),
    }
}

/// Fold the contributions of all members, in member order, into one buffer
pub(crate) fn reduce_all(
    op: DartOp,
    dtype: DartDatatype,
    contribs: &[Vec<u8>],
) -> DartResult<Vec<u8>> {
    let mut iter = contribs.iter();
    let mut acc = match iter.next() {
        Some(first) => first.clone(),
        None => return Err(DartError::Inval),
    };
    for c in iter {
        reduce_bytes(op, dtype, &mut acc, c)?;
    }
    Ok(acc)
}
