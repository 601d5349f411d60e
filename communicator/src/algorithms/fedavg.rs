use comms::{
    CommError,
    specs::{AggregatedResult, PayloadKind, Reduction},
};

use super::RoundCounter;
use crate::{Communicator, LocalModel, Weighting};

/// Sample weighted model averaging.
#[derive(Debug, Clone)]
pub struct FedAvg {
    rounds: RoundCounter,
}

impl Default for FedAvg {
    fn default() -> Self {
        Self::new()
    }
}

impl FedAvg {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a new `FedAvg` whose first round has id `round`.
    pub fn starting_at(round: u64) -> Self {
        Self {
            rounds: RoundCounter(round),
        }
    }

    /// Replaces the local model by the sample weighted mean of every worker's model.
    ///
    /// # Arguments
    /// * `comm` - The connection to the coordinator.
    /// * `model` - The local model, overwritten with the average.
    /// * `local_samples` - The amount of samples the local model was trained on this round.
    ///
    /// # Returns
    /// The aggregated result of the round.
    pub async fn aggregate<C, M>(
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
        let params = model.parameters();

        let result = comm
            .aggregate(
                &params,
                PayloadKind::Parameters,
                round,
                Reduction::WeightedSum,
                Weighting::BySamples(local_samples),
            )
            .await?;

        model.load_parameters(&result.params)?;
        Ok(result)
    }
}
