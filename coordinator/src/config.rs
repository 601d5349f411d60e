use std::{env, fs, num::NonZeroUsize, path::Path, time::Duration};

use comms::config::{
    self, ConfigError, DEFAULT_ROUND_TIMEOUT_SECS, default_addr, default_round_timeout_secs,
};
use serde::Deserialize;

/// The settings of a coordinator process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinatorConfig {
    /// The address to listen at.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// The amount of contributions that completes a round.
    pub total_clients: NonZeroUsize,
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
}

impl CoordinatorConfig {
    /// Creates a new `CoordinatorConfig` listening at the default address.
    pub fn new(total_clients: NonZeroUsize) -> Self {
        Self {
            addr: default_addr(),
            total_clients,
            round_timeout_secs: DEFAULT_ROUND_TIMEOUT_SECS,
        }
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

    /// Reads the configuration from the `HOST`, `PORT`, `TOTAL_CLIENTS` and
    /// `ROUND_TIMEOUT_SECS` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Like `from_env` but reading the variables through `lookup`.
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, `None` if it isn't set.
    ///
    /// # Returns
    /// The configuration or a `ConfigError` if a variable is missing or malformed.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            addr: config::addr_var(&lookup)?,
            total_clients: config::require_var(&lookup, "TOTAL_CLIENTS")?,
            round_timeout_secs: config::parse_var(&lookup, "ROUND_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_ROUND_TIMEOUT_SECS),
        }
        .validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        config::check_round_timeout(self.round_timeout_secs)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<_, _> = pairs.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn env_defaults() {
        let config = CoordinatorConfig::from_vars(vars(&[("TOTAL_CLIENTS", "3")])).unwrap();

        assert_eq!(config.addr, "127.0.0.1:50051");
        assert_eq!(config.total_clients.get(), 3);
        assert_eq!(config.round_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides() {
        let config = CoordinatorConfig::from_vars(vars(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "9000"),
            ("TOTAL_CLIENTS", "2"),
            ("ROUND_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.round_timeout_secs, 5);
    }

    #[test]
    fn missing_and_invalid_vars() {
        let err = CoordinatorConfig::from_vars(vars(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("TOTAL_CLIENTS")));

        let err = CoordinatorConfig::from_vars(vars(&[("TOTAL_CLIENTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "TOTAL_CLIENTS", .. }));

        let err = CoordinatorConfig::from_vars(vars(&[
            ("TOTAL_CLIENTS", "2"),
            ("ROUND_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "ROUND_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn json_fills_defaults() {
        let config: CoordinatorConfig = serde_json::from_str(r#"{"total_clients": 4}"#).unwrap();
        assert_eq!(config, CoordinatorConfig::new(NonZeroUsize::new(4).unwrap()));
    }
}
