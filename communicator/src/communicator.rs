use comms::{
    CommError, ParameterSet,
    specs::{AggregatedResult, PayloadKind, Reduction},
};

/// The part a process plays in the system, fixed by its worker id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Worker 0, it owns the canonical model.
    Coordinator,
    Worker,
}

impl Role {
    pub fn of(worker_id: u32) -> Self {
        if worker_id == 0 {
            Self::Coordinator
        } else {
            Self::Worker
        }
    }
}

/// How a payload is weighted before reaching the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// The payload is sent as is.
    None,
    /// The payload is scaled by this worker's share of the round's samples.
    BySamples(u64),
}

/// The two collective primitives every combination strategy is built from.
#[trait_variant::make(Communicator: Send)]
pub trait LocalCommunicator {
    fn worker_id(&self) -> u32;

    fn role(&self) -> Role {
        Role::of(self.worker_id())
    }

    /// Distributes the canonical model.
    ///
    /// The coordinator role publishes `model` at `version`, worker roles fetch the canonical
    /// model at `version` or newer, waiting for it to be published.
    ///
    /// # Arguments
    /// * `model` - The caller's model, published or used to validate the fetched one.
    /// * `version` - The version to publish or the oldest acceptable one.
    ///
    /// # Returns
    /// The canonical model, identical for every caller.
    async fn broadcast(
        &mut self,
        model: &ParameterSet,
        version: u64,
    ) -> Result<ParameterSet, CommError>;

    /// Combines `payload` with every other worker's contribution to `round`.
    ///
    /// Blocks until every worker contributed. With `Weighting::BySamples` the payload is
    /// sent as a `WeightedSum` regardless of `reduction`.
    ///
    /// # Arguments
    /// * `payload` - This worker's contribution.
    /// * `kind` - Whether `payload` holds parameters or a delta.
    /// * `round` - The logical round id, shared by every worker.
    /// * `reduction` - How the coordinator combines the contributions.
    /// * `weighting` - How the payload is weighted beforehand.
    ///
    /// # Returns
    /// The reduced result, identical for every worker of the round.
    async fn aggregate(
        &mut self,
        payload: &ParameterSet,
        kind: PayloadKind,
        round: u64,
        reduction: Reduction,
        weighting: Weighting,
    ) -> Result<AggregatedResult, CommError>;
}
