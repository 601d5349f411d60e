use std::{error::Error, fmt, io};

use serde::{Deserialize, Serialize};

use crate::specs::RoundKey;

/// The protocol level failures of an aggregation.
///
/// These travel over the wire inside `Msg::Err`, and the same value is handed to every
/// caller blocked on a failed round, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationError {
    /// An element type tag outside the supported set, or a dtype that can't be reduced.
    UnsupportedDtype {
        dtype: String,
        supported: Vec<String>,
    },
    /// The encoded payload disagrees with its own declared lengths.
    CorruptPayload { detail: String },
    /// Two parameter sets of the same round differ in keys, shapes, dtypes or policy.
    SchemaMismatch { key: String, detail: String },
    /// The same worker contributed twice to a round.
    DuplicateContributor { worker_id: u32, round: RoundKey },
    /// The worker id falls outside of the expected quorum.
    UnknownContributor { worker_id: u32, total_clients: usize },
    /// The round already finished or was superseded by a newer one.
    StaleRound { round: RoundKey, watermark: RoundKey },
    /// A reduction was asked to combine nothing.
    EmptyRound,
    /// The quorum wasn't reached before the round's deadline.
    RoundTimeout { round: RoundKey },
    /// The connection isn't allowed to make the request with its identity.
    Unauthorized { detail: String },
}

impl AggregationError {
    /// Creates a `CorruptPayload` error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptPayload {
            detail: detail.into(),
        }
    }

    /// Creates an `Unauthorized` error.
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::Unauthorized {
            detail: detail.into(),
        }
    }

    /// Creates a `SchemaMismatch` error for `key`.
    pub fn schema(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            key: key.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedDtype { dtype, supported } => {
                write!(f, "unsupported dtype {dtype}, supported: {supported:?}")
            }
            Self::CorruptPayload { detail } => write!(f, "corrupt payload: {detail}"),
            Self::SchemaMismatch { key, detail } => {
                write!(f, "schema mismatch at key '{key}': {detail}")
            }
            Self::DuplicateContributor { worker_id, round } => {
                write!(f, "worker {worker_id} already contributed to round {round}")
            }
            Self::UnknownContributor {
                worker_id,
                total_clients,
            } => write!(
                f,
                "worker {worker_id} is outside of the quorum of {total_clients} clients"
            ),
            Self::StaleRound { round, watermark } => {
                write!(f, "round {round} is stale, rounds up to {watermark} are finished")
            }
            Self::EmptyRound => f.write_str("cannot reduce an empty round"),
            Self::RoundTimeout { round } => {
                write!(f, "round {round} timed out before reaching quorum")
            }
            Self::Unauthorized { detail } => write!(f, "unauthorized: {detail}"),
        }
    }
}

impl Error for AggregationError {}

/// Failures of a communication endpoint.
#[derive(Debug)]
pub enum CommError {
    Io(io::Error),
    Aggregation(AggregationError),
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Aggregation(e) => write!(f, "aggregation error: {e}"),
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
        }
    }
}

impl Error for CommError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Aggregation(e) => Some(e),
            Self::UnexpectedMessage { .. } => None,
        }
    }
}

impl From<io::Error> for CommError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<AggregationError> for CommError {
    fn from(value: AggregationError) -> Self {
        Self::Aggregation(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CommError> for io::Error {
    fn from(value: CommError) -> Self {
        match value {
            CommError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
