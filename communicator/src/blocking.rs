use comms::{
    CommError, ParameterSet,
    specs::{AggregatedResult, PayloadKind, Reduction},
};
use tokio::runtime::Runtime;

use crate::{Communicator, CommunicatorConfig, CommunicatorHandle, Role, Weighting};

/// A synchronous facade over a `CommunicatorHandle` for callers outside of an async runtime.
///
/// Every call blocks the current thread until the coordinator replies, it must not be used
/// from within a tokio runtime.
pub struct BlockingCommunicator {
    runtime: Runtime,
    handle: CommunicatorHandle,
}

impl BlockingCommunicator {
    /// Connects to the coordinator on a runtime owned by the returned instance.
    ///
    /// # Arguments
    /// * `config` - This process's identity.
    ///
    /// # Returns
    /// A new `BlockingCommunicator` or an error if the coordinator couldn't be reached.
    pub fn connect(config: CommunicatorConfig) -> Result<Self, CommError> {
        let runtime = Runtime::new()?;
        let handle = runtime.block_on(CommunicatorHandle::connect(config))?;
        Ok(Self { runtime, handle })
    }

    pub fn role(&self) -> Role {
        self.handle.role()
    }

    pub fn config(&self) -> &CommunicatorConfig {
        self.handle.config()
    }

    /// Blocking version of `Communicator::broadcast`.
    pub fn broadcast(
        &mut self,
        model: &ParameterSet,
        version: u64,
    ) -> Result<ParameterSet, CommError> {
        self.runtime.block_on(self.handle.broadcast(model, version))
    }

    /// Blocking version of `Communicator::aggregate`.
    pub fn aggregate(
        &mut self,
        payload: &ParameterSet,
        kind: PayloadKind,
        round: u64,
        reduction: Reduction,
        weighting: Weighting,
    ) -> Result<AggregatedResult, CommError> {
        let call = self.handle.aggregate(payload, kind, round, reduction, weighting);
        self.runtime.block_on(call)
    }

    /// Closes the connection gracefully.
    pub fn disconnect(self) -> Result<(), CommError> {
        let Self { runtime, handle } = self;
        runtime.block_on(handle.disconnect())
    }
}
