use crate::AggregationError;

/// Reads a message back from a complete frame body.
pub trait Deserialize: Sized {
    fn deserialize(buf: &[u8]) -> Result<Self, AggregationError>;
}
