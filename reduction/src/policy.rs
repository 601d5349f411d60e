use comms::{AggregationError, ParameterSet, Tensor, specs::Reduction};
use rayon::prelude::*;

use crate::numeric::{Numeric, store, values, with_numeric};

/// Combines the parameter sets of a round into one.
pub trait Reducer {
    /// Reduces `inputs` entry by entry.
    ///
    /// # Arguments
    /// * `inputs` - The contributions of a round, already sorted by worker id.
    ///
    /// # Returns
    /// A parameter set with the keys, dtypes, shapes and devices of the first input or
    /// an `AggregationError` if the inputs are empty, disagree in schema or hold bool tensors.
    fn reduce(&self, inputs: &[&ParameterSet]) -> Result<ParameterSet, AggregationError>;
}

impl Reducer for Reduction {
    fn reduce(&self, inputs: &[&ParameterSet]) -> Result<ParameterSet, AggregationError> {
        let (first, rest) = inputs.split_first().ok_or(AggregationError::EmptyRound)?;
        for other in rest {
            first.check_schema(other)?;
        }

        let entries: Vec<_> = first.iter().collect();
        let reduced = entries
            .into_par_iter()
            .map(|(name, tensor)| {
                let column = inputs
                    .iter()
                    .map(|params| {
                        params
                            .get(name)
                            .ok_or_else(|| AggregationError::schema(name, "missing key"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                with_numeric!(tensor.dtype(), reduce_column, *self, name, &column)
                    .map(|t| (name.to_string(), t))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(reduced.into_iter().collect())
    }
}

/// Reduces the same entry across every input, in input order.
fn reduce_column<T: Numeric>(
    policy: Reduction,
    name: &str,
    column: &[&Tensor],
) -> Result<Tensor, AggregationError> {
    let (first, rest) = column.split_first().ok_or(AggregationError::EmptyRound)?;
    let mut acc = values::<T>(name, first)?;

    for tensor in rest {
        let other = values::<T>(name, tensor)?;
        acc.iter_mut().zip(other).for_each(|(a, b)| *a = a.add(b));
    }

    if policy == Reduction::Mean {
        let count = column.len();
        acc.iter_mut().for_each(|a| *a = a.div_count(count));
    }

    let mut out = (*first).clone();
    store(name, &mut out, &acc)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use comms::{Dtype, ParameterSet, Tensor};

    use super::*;

    fn set(name: &str, tensor: Tensor) -> ParameterSet {
        [(name, tensor)].into_iter().collect()
    }

    #[test]
    fn sum_and_mean_of_scalars() {
        let inputs: Vec<_> = [2.0f32, 4.0, 6.0]
            .iter()
            .map(|&v| set("w", Tensor::vector(&[v])))
            .collect();
        let refs: Vec<_> = inputs.iter().collect();

        let sum = Reduction::Sum.reduce(&refs).unwrap();
        assert_eq!(sum.get("w").unwrap().to_vec::<f32>().unwrap(), [12.0]);

        let mean = Reduction::Mean.reduce(&refs).unwrap();
        assert_eq!(mean.get("w").unwrap().to_vec::<f32>().unwrap(), [4.0]);
    }

    #[test]
    fn weighted_sum_of_prescaled_inputs() {
        // samples [10, 30] scaled by 10/40 and 30/40
        let a = set("w", Tensor::vector(&[1.0f64 * 0.25]));
        let b = set("w", Tensor::vector(&[3.0f64 * 0.75]));

        let out = Reduction::WeightedSum.reduce(&[&a, &b]).unwrap();
        assert_eq!(out.get("w").unwrap().to_vec::<f64>().unwrap(), [2.5]);
    }

    #[test]
    fn output_keeps_first_input_order_and_devices() {
        let a: ParameterSet = [
            ("z", Tensor::vector(&[1i64]).with_device("cuda:0")),
            ("a", Tensor::from_slice(&[2, 1], &[1i32, 2]).unwrap()),
        ]
        .into_iter()
        .collect();
        let b: ParameterSet = [
            ("a", Tensor::from_slice(&[2, 1], &[3i32, 4]).unwrap()),
            ("z", Tensor::vector(&[5i64]).with_device("cuda:3")),
        ]
        .into_iter()
        .collect();

        let out = Reduction::Sum.reduce(&[&a, &b]).unwrap();
        assert_eq!(out.names().collect::<Vec<_>>(), ["z", "a"]);

        let z = out.get("z").unwrap();
        assert_eq!(z.device(), "cuda:0");
        assert_eq!(z.to_vec::<i64>().unwrap(), [6]);

        let a = out.get("a").unwrap();
        assert_eq!(a.shape(), [2, 1]);
        assert_eq!(a.to_vec::<i32>().unwrap(), [4, 6]);
    }

    #[test]
    fn integer_mean_truncates_and_sum_wraps() {
        let a = set("n", Tensor::vector(&[i32::MAX, 1]));
        let b = set("n", Tensor::vector(&[1i32, 2]));

        let sum = Reduction::Sum.reduce(&[&a, &b]).unwrap();
        assert_eq!(sum.get("n").unwrap().to_vec::<i32>().unwrap(), [i32::MIN, 3]);

        let mean = Reduction::Mean.reduce(&[&a, &b]).unwrap();
        assert_eq!(mean.get("n").unwrap().to_vec::<i32>().unwrap()[1], 1);
    }

    #[test]
    fn empty_round() {
        let err = Reduction::Sum.reduce(&[]).unwrap_err();
        assert_eq!(err, AggregationError::EmptyRound);
    }

    #[test]
    fn shape_mismatch_names_the_key() {
        let a = set("w", Tensor::vector(&[0.0f32; 4]));
        let b = set("w", Tensor::vector(&[0.0f32; 5]));

        match Reduction::Mean.reduce(&[&a, &b]).unwrap_err() {
            AggregationError::SchemaMismatch { key, .. } => assert_eq!(key, "w"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bool_tensors_are_not_reducible() {
        let a = set("mask", Tensor::from_bools(&[2], &[true, false]).unwrap());

        match Reduction::Sum.reduce(&[&a, &a.clone()]).unwrap_err() {
            AggregationError::UnsupportedDtype { dtype, supported } => {
                assert_eq!(dtype, Dtype::Bool.name());
                assert_eq!(supported, ["float32", "float64", "int32", "int64"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
