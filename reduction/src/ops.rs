//! Elementwise arithmetic over whole parameter sets.

use comms::{AggregationError, ParameterSet, Tensor};

pub use crate::numeric::ensure_float;
use crate::numeric::{Float, Numeric, store, values, with_float, with_numeric};

/// Multiplies every element of `params` by `factor` in place.
///
/// Only float tensors can be scaled, the set is left untouched if any entry isn't one.
pub fn scale(params: &mut ParameterSet, factor: f64) -> Result<(), AggregationError> {
    ensure_float(params)?;

    for (name, tensor) in params.iter_mut() {
        with_float!(tensor.dtype(), scale_tensor, name, tensor, factor)?;
    }

    Ok(())
}

fn scale_tensor<T: Float>(
    name: &str,
    tensor: &mut Tensor,
    factor: f64,
) -> Result<(), AggregationError> {
    let factor = T::from_f64(factor);
    let scaled: Vec<T> = values::<T>(name, tensor)?
        .into_iter()
        .map(|v| v * factor)
        .collect();

    store(name, tensor, &scaled)
}

/// Computes `lhs - rhs` entry by entry.
///
/// # Returns
/// A new set laid out like `lhs`, or an error if the schemas differ or an entry isn't numeric.
pub fn sub(lhs: &ParameterSet, rhs: &ParameterSet) -> Result<ParameterSet, AggregationError> {
    lhs.check_schema(rhs)?;

    lhs.iter()
        .map(|(name, a)| {
            let b = rhs
                .get(name)
                .ok_or_else(|| AggregationError::schema(name, "missing key"))?;

            with_numeric!(a.dtype(), sub_tensor, name, a, b).map(|t| (name, t))
        })
        .collect()
}

fn sub_tensor<T: Numeric>(name: &str, a: &Tensor, b: &Tensor) -> Result<Tensor, AggregationError> {
    let diff: Vec<T> = values::<T>(name, a)?
        .into_iter()
        .zip(values::<T>(name, b)?)
        .map(|(x, y)| x.sub(y))
        .collect();

    let mut out = a.clone();
    store(name, &mut out, &diff)?;
    Ok(out)
}

/// The sum of the squared elementwise differences between two sets.
pub fn squared_distance(lhs: &ParameterSet, rhs: &ParameterSet) -> Result<f64, AggregationError> {
    let diff = sub(lhs, rhs)?;

    diff.iter()
        .map(|(name, tensor)| with_numeric!(tensor.dtype(), squared_norm, name, tensor))
        .sum()
}

fn squared_norm<T: Numeric>(name: &str, tensor: &Tensor) -> Result<f64, AggregationError> {
    Ok(values::<T>(name, tensor)?
        .into_iter()
        .map(|v| v.to_f64() * v.to_f64())
        .sum())
}

/// A set laid out like `params` with every element set to zero.
pub fn zeros_like(params: &ParameterSet) -> ParameterSet {
    params
        .iter()
        .map(|(name, tensor)| (name, tensor.zeroed()))
        .collect()
}
