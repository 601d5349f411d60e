use std::ops::{Add, Mul, Sub};

use comms::{AggregationError, Dtype, Element, ParameterSet, Tensor};

/// The element types that support reductions.
pub const NUMERIC: [Dtype; 4] = [Dtype::F32, Dtype::F64, Dtype::I32, Dtype::I64];

/// The element types that can be scaled by a real weight.
pub const FLOATS: [Dtype; 2] = [Dtype::F32, Dtype::F64];

/// Arithmetic shared by every reducible element type.
pub(crate) trait Numeric: Element + Send + Sync {
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    /// Divides by an amount of contributions, integers truncate.
    fn div_count(self, count: usize) -> Self;
    fn to_f64(self) -> f64;
}

/// Real valued element types.
pub(crate) trait Float: Numeric + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> {
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_int {
    ($($t:ty),*) => {$(
        impl Numeric for $t {
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }

            fn div_count(self, count: usize) -> Self {
                self / count as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

macro_rules! impl_float {
    ($($t:ty),*) => {$(
        impl Numeric for $t {
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }

            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }

            fn div_count(self, count: usize) -> Self {
                self / count as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }

        impl Float for $t {
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    )*};
}

impl_int!(i32, i64);
impl_float!(f32, f64);

/// Reads the elements of `tensor` as `T`, failing with a schema error on a dtype mismatch.
pub(crate) fn values<T: Element>(name: &str, tensor: &Tensor) -> Result<Vec<T>, AggregationError> {
    tensor.to_vec().ok_or_else(|| {
        AggregationError::schema(name, format!("expected {}, got {}", T::DTYPE, tensor.dtype()))
    })
}

/// Overwrites the elements of `tensor`, failing with a schema error on a layout mismatch.
pub(crate) fn store<T: Element>(
    name: &str,
    tensor: &mut Tensor,
    values: &[T],
) -> Result<(), AggregationError> {
    tensor.set_values(values).ok_or_else(|| {
        AggregationError::schema(name, format!("cannot store {} values", values.len()))
    })
}

/// The error for a dtype outside of `supported`.
pub(crate) fn unsupported(dtype: Dtype, supported: &[Dtype]) -> AggregationError {
    AggregationError::UnsupportedDtype {
        dtype: dtype.name().to_string(),
        supported: Dtype::names(supported),
    }
}

/// Fails with `UnsupportedDtype` on the first entry that isn't a float.
pub fn ensure_float(params: &ParameterSet) -> Result<(), AggregationError> {
    match params.iter().map(|(_, t)| t.dtype()).find(|d| !d.is_float()) {
        Some(dtype) => Err(unsupported(dtype, &FLOATS)),
        None => Ok(()),
    }
}

/// Calls a generic function with the concrete type behind a numeric `Dtype`.
///
/// Bool tensors evaluate to an `UnsupportedDtype` error.
macro_rules! with_numeric {
    ($dtype:expr, $func:ident $(, $arg:expr)* $(,)?) => {
        match $dtype {
            comms::Dtype::F32 => $func::<f32>($($arg),*),
            comms::Dtype::F64 => $func::<f64>($($arg),*),
            comms::Dtype::I32 => $func::<i32>($($arg),*),
            comms::Dtype::I64 => $func::<i64>($($arg),*),
            dtype => Err($crate::numeric::unsupported(dtype, &$crate::numeric::NUMERIC)),
        }
    };
}

/// Like `with_numeric` but only for real valued types.
macro_rules! with_float {
    ($dtype:expr, $func:ident $(, $arg:expr)* $(,)?) => {
        match $dtype {
            comms::Dtype::F32 => $func::<f32>($($arg),*),
            comms::Dtype::F64 => $func::<f64>($($arg),*),
            dtype => Err($crate::numeric::unsupported(dtype, &$crate::numeric::FLOATS)),
        }
    };
}

pub(crate) use {with_float, with_numeric};
