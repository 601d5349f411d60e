use comms::{AggregationError, ParameterSet, Tensor};

use crate::{
    numeric::{Float, ensure_float, store, values, with_float},
    ops,
};

/// Momentum applied to an aggregated update.
///
/// Each step computes `v = momentum * v + delta` and then `params -= learning_rate * v`.
#[derive(Debug, Clone)]
pub struct Momentum {
    learning_rate: f64,
    momentum: f64,
    velocity: Option<ParameterSet>,
}

impl Momentum {
    /// Creates a new `Momentum` with a zero velocity.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The decay of the accumulated velocity.
    ///
    /// # Returns
    /// A new `Momentum` instance.
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: None,
        }
    }

    /// Starts from a given velocity instead of zeros.
    pub fn with_velocity(mut self, velocity: ParameterSet) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn velocity(&self) -> Option<&ParameterSet> {
        self.velocity.as_ref()
    }

    /// Applies one momentum step to `params`.
    ///
    /// # Arguments
    /// * `params` - The parameters to update in place.
    /// * `delta` - The update direction, laid out like `params`.
    ///
    /// # Returns
    /// An error if the layouts differ or a tensor isn't a float, nothing is updated in that case.
    pub fn step(
        &mut self,
        params: &mut ParameterSet,
        delta: &ParameterSet,
    ) -> Result<(), AggregationError> {
        params.check_schema(delta)?;
        ensure_float(delta)?;

        let velocity = self.velocity.get_or_insert_with(|| ops::zeros_like(delta));
        velocity.check_schema(delta)?;

        let (lr, mu) = (self.learning_rate, self.momentum);
        for (name, p) in params.iter_mut() {
            let (Some(v), Some(d)) = (velocity.get_mut(name), delta.get(name)) else {
                return Err(AggregationError::schema(name, "missing key"));
            };

            with_float!(p.dtype(), step_tensor, name, p, v, d, lr, mu)?;
        }

        Ok(())
    }
}

fn step_tensor<T: Float>(
    name: &str,
    param: &mut Tensor,
    velocity: &mut Tensor,
    delta: &Tensor,
    lr: f64,
    mu: f64,
) -> Result<(), AggregationError> {
    let mut p = values::<T>(name, param)?;
    let mut v = values::<T>(name, velocity)?;
    let d = values::<T>(name, delta)?;
    let (lr, mu) = (T::from_f64(lr), T::from_f64(mu));

    p.iter_mut()
        .zip(v.iter_mut())
        .zip(d)
        .for_each(|((p, v), d)| {
            *v = (mu * *v) + d;
            *p = *p - lr * *v;
        });

    store(name, velocity, &v)?;
    store(name, param, &p)
}
