use comms::{
    CommError, ParameterSet,
    specs::{AggregatedResult, PayloadKind, Reduction},
};
use reduction::ops;

use super::RoundCounter;
use crate::{Communicator, LocalModel, Weighting};

/// Model averaging with a proximal penalty keeping local models close to the global one.
///
/// The penalty itself is applied by the external optimizer through `proximal_term` and
/// `proximal_gradient`.
#[derive(Debug, Clone)]
pub struct FedProx {
    mu: f64,
    global: ParameterSet,
    version: u64,
    rounds: RoundCounter,
}

impl FedProx {
    /// Creates a new `FedProx`.
    ///
    /// # Arguments
    /// * `model` - The starting model, every worker must start from the same one.
    /// * `mu` - The strength of the proximal penalty.
    ///
    /// # Returns
    /// A new `FedProx` instance.
    pub fn new<M: LocalModel>(model: &M, mu: f64) -> Self {
        Self {
            mu,
            global: model.parameters(),
            version: 0,
            rounds: RoundCounter(0),
        }
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// The cached global model.
    pub fn global(&self) -> &ParameterSet {
        &self.global
    }

    /// Synchronizes the local model with the canonical one and caches it.
    pub async fn round_start<C, M>(&mut self, comm: &mut C, model: &mut M) -> Result<(), CommError>
    where
        C: Communicator,
        M: LocalModel,
    {
        let global = comm.broadcast(&model.parameters(), self.version).await?;
        model.load_parameters(&global)?;
        self.global = global;
        Ok(())
    }

    /// `(mu / 2) * ||local - global||²`.
    pub fn proximal_term(&self, local: &ParameterSet) -> Result<f64, CommError> {
        let distance = ops::squared_distance(local, &self.global)?;
        Ok(self.mu / 2.0 * distance)
    }

    /// `mu * (local - global)`, the gradient of `proximal_term`.
    pub fn proximal_gradient(&self, local: &ParameterSet) -> Result<ParameterSet, CommError> {
        let mut gradient = ops::sub(local, &self.global)?;
        ops::scale(&mut gradient, self.mu)?;
        Ok(gradient)
    }

    /// Replaces the local model by the sample weighted mean of every worker's model.
    ///
    /// A round without samples yields a zero weight for everyone.
    pub async fn round_end<C, M>(
        &mut self,
        comm: &mut C,
        model: &mut M,
        local_samples: u64,
    ) -> Result<AggregatedResult, CommError>
    where
        C: Communicator,
        M: LocalModel,
    {
        let round = self.rounds.next();

        let result = comm
            .aggregate(
                &model.parameters(),
                PayloadKind::Parameters,
                round,
                Reduction::WeightedSum,
                Weighting::BySamples(local_samples),
            )
            .await?;

        model.load_parameters(&result.params)?;
        self.version += 1;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use comms::Tensor;

    use super::*;

    fn vector(values: &[f64]) -> ParameterSet {
        [("w", Tensor::vector(values))].into_iter().collect()
    }

    #[test]
    fn proximal_penalty_against_the_cached_model() {
        let fedprox = FedProx::new(&vector(&[1.0, 1.0]), 0.5);

        let local = vector(&[3.0, 1.0]);
        assert_eq!(fedprox.proximal_term(&local).unwrap(), 1.0);

        let gradient = fedprox.proximal_gradient(&local).unwrap();
        assert_eq!(gradient.get("w").unwrap().to_vec::<f64>().unwrap(), [1.0, 0.0]);

        assert_eq!(fedprox.proximal_term(fedprox.global()).unwrap(), 0.0);
    }

    #[test]
    fn penalty_needs_the_same_schema() {
        let fedprox = FedProx::new(&vector(&[1.0]), 0.1);

        let err = fedprox.proximal_term(&vector(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, CommError::Aggregation(_)));
    }
}
