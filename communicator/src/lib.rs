pub mod algorithms;
mod blocking;
mod communicator;
mod config;
mod handle;
mod model;

pub use blocking::BlockingCommunicator;
pub use communicator::{Communicator, LocalCommunicator, Role, Weighting};
pub use config::CommunicatorConfig;
pub use handle::CommunicatorHandle;
pub use model::LocalModel;

pub use comms::{AggregationError, CommError, ConfigError, ParameterSet, Tensor};
pub use comms::specs::{AggregatedResult, PayloadKind, Reduction};
