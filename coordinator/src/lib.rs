mod config;
pub mod rounds;
mod service;
mod snapshot;

pub use comms::ConfigError;
pub use config::CoordinatorConfig;
pub use rounds::{Pending, RoundTable};
pub use service::Coordinator;
pub use snapshot::SnapshotStore;
