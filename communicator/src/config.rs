use std::{env, fs, num::NonZeroUsize, path::Path, time::Duration};

use comms::config::{
    self, ConfigError, DEFAULT_ROUND_TIMEOUT_SECS, default_addr, default_round_timeout_secs,
};
use serde::Deserialize;

/// The identity of a worker process, immutable for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommunicatorConfig {
    /// This process's id, 0 takes the coordinator role.
    pub worker_id: u32,
    pub total_clients: NonZeroUsize,
    #[serde(default = "default_addr")]
    pub coordinator_addr: String,
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
}

impl CommunicatorConfig {
    /// Creates a new `CommunicatorConfig` with the default round timeout.
    ///
    /// # Arguments
    /// * `worker_id` - This process's id within `0..total_clients`.
    /// * `total_clients` - The amount of workers taking part in every round.
    /// * `coordinator_addr` - The address the coordinator listens at.
    pub fn new(
        worker_id: u32,
        total_clients: NonZeroUsize,
        coordinator_addr: impl Into<String>,
    ) -> Self {
        Self {
            worker_id,
            total_clients,
            coordinator_addr: coordinator_addr.into(),
            round_timeout_secs: DEFAULT_ROUND_TIMEOUT_SECS,
        }
    }

    pub fn with_round_timeout_secs(mut self, secs: u64) -> Self {
        self.round_timeout_secs = secs;
        self
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    /// Reads the configuration from a json file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()
    }

    /// Reads the configuration from the `WORKER_ID`, `TOTAL_CLIENTS`, `HOST`, `PORT` and
    /// `ROUND_TIMEOUT_SECS` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Like `from_env` but reading the variables through `lookup`.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            worker_id: config::require_var(&lookup, "WORKER_ID")?,
            total_clients: config::require_var(&lookup, "TOTAL_CLIENTS")?,
            coordinator_addr: config::addr_var(&lookup)?,
            round_timeout_secs: config::parse_var(&lookup, "ROUND_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_ROUND_TIMEOUT_SECS),
        }
        .validate()
    }

    /// Fails if the worker id falls outside of the quorum or the round timeout is zero.
    fn validate(self) -> Result<Self, ConfigError> {
        config::check_round_timeout(self.round_timeout_secs)?;

        if self.worker_id as usize >= self.total_clients.get() {
            return Err(ConfigError::InvalidVar {
                name: "WORKER_ID",
                value: self.worker_id.to_string(),
            });
        }

        Ok(self)
    }
}
