use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AggregationError;

/// The step inside a logical round a contribution belongs to.
///
/// Sample weighted aggregation needs two barriers per logical round, one for the sample
/// counts and one for the scaled payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SampleCount,
    Payload,
}

impl Phase {
    /// The wire tag of this phase.
    pub fn tag(self) -> u8 {
        match self {
            Self::SampleCount => 0,
            Self::Payload => 1,
        }
    }

    /// Resolves a wire tag.
    ///
    /// # Returns
    /// The phase or a `CorruptPayload` error if the tag is unknown.
    pub fn from_tag(tag: u8) -> Result<Self, AggregationError> {
        match tag {
            0 => Ok(Self::SampleCount),
            1 => Ok(Self::Payload),
            _ => Err(AggregationError::corrupt(format!("unknown phase tag {tag}"))),
        }
    }
}

/// Identifies one barrier of the coordinator.
///
/// Keys are ordered by round first and phase second, which is the order a well behaved
/// worker submits them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundKey {
    pub round: u64,
    pub phase: Phase,
}

impl RoundKey {
    /// Creates a new `RoundKey`.
    ///
    /// # Arguments
    /// * `round` - The logical training round.
    /// * `phase` - The step inside that round.
    ///
    /// # Returns
    /// A new `RoundKey` instance.
    pub fn new(round: u64, phase: Phase) -> Self {
        Self { round, phase }
    }

    /// The payload barrier of `round`.
    pub fn payload(round: u64) -> Self {
        Self::new(round, Phase::Payload)
    }

    /// The sample count barrier of `round`.
    pub fn samples(round: u64) -> Self {
        Self::new(round, Phase::SampleCount)
    }
}

impl fmt::Display for RoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::SampleCount => "samples",
            Phase::Payload => "payload",
        };

        write!(f, "{}/{phase}", self.round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_round_then_phase() {
        assert!(RoundKey::samples(5) < RoundKey::payload(5));
        assert!(RoundKey::payload(5) < RoundKey::samples(6));
        assert_eq!(RoundKey::payload(6).to_string(), "6/payload");
    }
}
