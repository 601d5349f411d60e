use comms::{
    CommError, ParameterSet,
    specs::{AggregatedResult, PayloadKind, Reduction},
};
use log::debug;
use reduction::{Momentum, ops};

use super::RoundCounter;
use crate::{Communicator, LocalModel, Weighting};

/// Model averaging with server style momentum.
///
/// Each round the sample weighted mean of `global - local` is fed to a momentum step over
/// the cached global model, every worker computes the same update.
#[derive(Debug, Clone)]
pub struct FedMom {
    momentum: Momentum,
    global: ParameterSet,
    version: u64,
    rounds: RoundCounter,
}

impl FedMom {
    /// Creates a new `FedMom`.
    ///
    /// # Arguments
    /// * `model` - The starting model, every worker must start from the same one.
    /// * `learning_rate` - The step size applied to the velocity.
    /// * `momentum` - The decay of the velocity.
    ///
    /// # Returns
    /// A new `FedMom` instance.
    pub fn new<M: LocalModel>(model: &M, learning_rate: f64, momentum: f64) -> Self {
        Self {
            momentum: Momentum::new(learning_rate, momentum),
            global: model.parameters(),
            version: 0,
            rounds: RoundCounter(0),
        }
    }

    /// The cached global model.
    pub fn global(&self) -> &ParameterSet {
        &self.global
    }

    pub fn velocity(&self) -> Option<&ParameterSet> {
        self.momentum.velocity()
    }

    /// Synchronizes the local model with the canonical one.
    ///
    /// The coordinator role publishes its model, the rest wait for it.
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

    /// Aggregates the local progress and applies the momentum step.
    ///
    /// # Arguments
    /// * `comm` - The connection to the coordinator.
    /// * `model` - The locally trained model, overwritten with the new global model.
    /// * `local_samples` - The amount of samples trained on this round.
    ///
    /// # Returns
    /// The aggregated delta of the round.
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
        let delta = ops::sub(&self.global, &model.parameters())?;

        let result = comm
            .aggregate(
                &delta,
                PayloadKind::Delta,
                round,
                Reduction::WeightedSum,
                Weighting::BySamples(local_samples),
            )
            .await?;

        self.momentum.step(&mut self.global, &result.params)?;
        model.load_parameters(&self.global)?;

        self.version += 1;
        debug!(version = self.version; "applied the momentum step of round {round}");

        Ok(result)
    }
}
