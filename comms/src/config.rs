//! Shared pieces of the coordinator and communicator configurations.

use std::{error::Error, fmt, io, str::FromStr};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 50051;
pub const DEFAULT_ROUND_TIMEOUT_SECS: u64 = 60;

/// Failures while loading a configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    MissingVar(&'static str),
    InvalidVar { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read the config file: {e}"),
            Self::Json(e) => write!(f, "invalid config file: {e}"),
            Self::MissingVar(name) => write!(f, "the variable {name} is not set"),
            Self::InvalidVar { name, value } => write!(f, "invalid value for {name}: {value:?}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Parses the variable `name` through `lookup`.
///
/// # Returns
/// `None` if the variable isn't set or `InvalidVar` if it doesn't parse as `T`.
pub fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidVar { name, value })
        })
        .transpose()
}

/// Like `parse_var` but failing with `MissingVar` when it isn't set.
pub fn require_var<T, F>(lookup: &F, name: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, name)?.ok_or(ConfigError::MissingVar(name))
}

/// The `HOST:PORT` address read through `lookup`, with the default host and port as fallback.
pub fn addr_var<F>(lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = parse_var(lookup, "PORT")?.unwrap_or(DEFAULT_PORT);
    Ok(format!("{host}:{port}"))
}

/// The address used when none is configured.
pub fn default_addr() -> String {
    format!("{DEFAULT_HOST}:{DEFAULT_PORT}")
}

pub fn default_round_timeout_secs() -> u64 {
    DEFAULT_ROUND_TIMEOUT_SECS
}

/// Fails on a zero round timeout, no round could ever reach quorum with it.
pub fn check_round_timeout(secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidVar {
            name: "ROUND_TIMEOUT_SECS",
            value: secs.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_require() {
        let lookup = |name: &str| (name == "N").then(|| " 7 ".to_string());

        assert_eq!(parse_var::<u32, _>(&lookup, "N").unwrap(), Some(7));
        assert_eq!(parse_var::<u32, _>(&lookup, "M").unwrap(), None);
        assert!(matches!(
            require_var::<u32, _>(&lookup, "M"),
            Err(ConfigError::MissingVar("M"))
        ));
        assert!(matches!(
            parse_var::<bool, _>(&lookup, "N"),
            Err(ConfigError::InvalidVar { name: "N", .. })
        ));
        assert_eq!(addr_var(&lookup).unwrap(), "127.0.0.1:50051");
    }

    #[test]
    fn zero_round_timeout() {
        assert!(check_round_timeout(1).is_ok());
        assert!(matches!(
            check_round_timeout(0),
            Err(ConfigError::InvalidVar { name: "ROUND_TIMEOUT_SECS", .. })
        ));
    }
}
