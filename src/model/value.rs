//! Typed signal payloads.
//!
//! A `Value` is a fixed-length vector of one of three numeric kinds. The
//! kind and length of a signal are fixed when the signal is created, and
//! every update must match both.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

/// Inline storage for short vectors; most signals are scalars or small
/// vectors, so updates stay off the heap.
pub type Elements<T> = SmallVec<[T; 4]>;

/// Numeric element type of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Type {
    Int32,
    Float32,
    Float64,
}

impl Type {
    /// OSC-style type character used on the wire.
    pub fn type_char(self) -> char {
        match self {
            Type::Int32 => 'i',
            Type::Float32 => 'f',
            Type::Float64 => 'd',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Type::Int32),
            'f' => Some(Type::Float32),
            'd' => Some(Type::Float64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Int32 => "int32",
            Type::Float32 => "float32",
            Type::Float64 => "float64",
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(self, Type::Int32)
    }

    /// The wider of two types (int32 < float32 < float64).
    pub fn promote(self, other: Type) -> Type {
        self.max(other)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed numeric vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Value {
    Int32(Elements<i32>),
    Float32(Elements<f32>),
    Float64(Elements<f64>),
}

// ============================================================================
// Construction and inspection
// ============================================================================

impl Value {
    /// A zero-filled value of the given type and length.
    pub fn zeros(ty: Type, len: usize) -> Self {
        match ty {
            Type::Int32 => Value::Int32(SmallVec::from_elem(0, len)),
            Type::Float32 => Value::Float32(SmallVec::from_elem(0.0, len)),
            Type::Float64 => Value::Float64(SmallVec::from_elem(0.0, len)),
        }
    }

    /// Build a value of type `ty` from double-precision elements.
    ///
    /// Narrowing to int32 truncates toward zero (saturating at the i32
    /// range); widening is exact.
    pub fn from_f64s(ty: Type, elements: &[f64]) -> Self {
        match ty {
            Type::Int32 => Value::Int32(elements.iter().map(|v| *v as i32).collect()),
            Type::Float32 => Value::Float32(elements.iter().map(|v| *v as f32).collect()),
            Type::Float64 => Value::Float64(elements.iter().copied().collect()),
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Int32(_) => Type::Int32,
            Value::Float32(_) => Type::Float32,
            Value::Float64(_) => Type::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Int32(v) => v.len(),
            Value::Float32(v) => v.len(),
            Value::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` widened to f64.
    pub fn get(&self, index: usize) -> Option<f64> {
        match self {
            Value::Int32(v) => v.get(index).map(|x| *x as f64),
            Value::Float32(v) => v.get(index).map(|x| *x as f64),
            Value::Float64(v) => v.get(index).copied(),
        }
    }

    /// Iterate all elements widened to f64.
    pub fn iter_f64(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Write all elements widened to f64 into `out`, replacing its contents.
    pub fn write_f64s(&self, out: &mut SmallVec<[f64; 8]>) {
        out.clear();
        out.extend(self.iter_f64());
    }

    /// Convert to another element type with the narrowing/widening rules of
    /// [`Value::from_f64s`]. Same-type conversion is a plain clone.
    pub fn coerce(&self, ty: Type) -> Value {
        if self.ty() == ty {
            return self.clone();
        }
        let widened: SmallVec<[f64; 8]> = self.iter_f64().collect();
        Value::from_f64s(ty, &widened)
    }

    /// Reject values that do not match a signal's declared type and length.
    pub fn check(&self, ty: Type, len: usize) -> Result<()> {
        if self.ty() != ty {
            return Err(Error::TypeMismatch {
                expected: ty.name().into(),
                got: self.ty().name().into(),
            });
        }
        if self.len() != len {
            return Err(Error::LengthMismatch { expected: len, got: self.len() });
        }
        Ok(())
    }

    /// True if every element is finite (ints always are).
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Int32(_) => true,
            Value::Float32(v) => v.iter().all(|x| x.is_finite()),
            Value::Float64(v) => v.iter().all(|x| x.is_finite()),
        }
    }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int32(smallvec::smallvec![v]) } }
impl From<f32> for Value { fn from(v: f32) -> Self { Value::Float32(smallvec::smallvec![v]) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float64(smallvec::smallvec![v]) } }

impl From<Vec<i32>> for Value { fn from(v: Vec<i32>) -> Self { Value::Int32(v.into_iter().collect()) } }
impl From<Vec<f32>> for Value { fn from(v: Vec<f32>) -> Self { Value::Float32(v.into_iter().collect()) } }
impl From<Vec<f64>> for Value { fn from(v: Vec<f64>) -> Self { Value::Float64(v.into_iter().collect()) } }

impl From<&[i32]> for Value { fn from(v: &[i32]) -> Self { Value::Int32(v.iter().copied().collect()) } }
impl From<&[f32]> for Value { fn from(v: &[f32]) -> Self { Value::Float32(v.iter().copied().collect()) } }
impl From<&[f64]> for Value { fn from(v: &[f64]) -> Self { Value::Float64(v.iter().copied().collect()) } }

impl<const N: usize> From<[i32; N]> for Value { fn from(v: [i32; N]) -> Self { Value::Int32(v.into_iter().collect()) } }
impl<const N: usize> From<[f32; N]> for Value { fn from(v: [f32; N]) -> Self { Value::Float32(v.into_iter().collect()) } }
impl<const N: usize> From<[f64; N]> for Value { fn from(v: [f64; N]) -> Self { Value::Float64(v.into_iter().collect()) } }

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            if items.len() == 1 {
                return write!(f, "{}", items[0]);
            }
            write!(f, "[")?;
            for (i, v) in items.iter().enumerate() {
                if i > 0 { write!(f, ", ")?; }
                write!(f, "{v}")?;
            }
            write!(f, "]")
        }
        match self {
            Value::Int32(v) => write_list(f, v),
            Value::Float32(v) => write_list(f, v),
            Value::Float64(v) => write_list(f, v),
        }
    }
}
