use serde::{Deserialize, Serialize};

use super::RoundKey;
use crate::{AggregationError, ParameterSet};

/// How the coordinator combines the contributions of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Sum,
    Mean,
    /// Callers pre-scale their payloads by their weight, the coordinator only sums.
    WeightedSum,
}

impl Reduction {
    pub fn tag(self) -> u8 {
        match self {
            Self::Sum => 0,
            Self::Mean => 1,
            Self::WeightedSum => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, AggregationError> {
        match tag {
            0 => Ok(Self::Sum),
            1 => Ok(Self::Mean),
            2 => Ok(Self::WeightedSum),
            _ => Err(AggregationError::corrupt(format!(
                "unknown reduction tag {tag}"
            ))),
        }
    }
}

/// Whether a payload holds the full model parameters or a difference between two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Parameters,
    Delta,
}

impl PayloadKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Parameters => 0,
            Self::Delta => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, AggregationError> {
        match tag {
            0 => Ok(Self::Parameters),
            1 => Ok(Self::Delta),
            _ => Err(AggregationError::corrupt(format!(
                "unknown payload kind tag {tag}"
            ))),
        }
    }
}

/// The metadata sent along a worker's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContributionHeader {
    pub round: RoundKey,
    pub worker_id: u32,
    pub sample_count: u64,
    pub kind: PayloadKind,
    pub reduction: Reduction,
}

/// One worker's payload submitted toward a round.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub header: ContributionHeader,
    pub params: ParameterSet,
}

/// The reduced parameters of a round, identical for every one of its callers.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedResult {
    pub round: RoundKey,
    pub contributors: u32,
    pub total_samples: u64,
    pub params: ParameterSet,
}
