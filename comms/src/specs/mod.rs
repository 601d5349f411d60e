mod aggregation;
mod round;

pub use aggregation::{AggregatedResult, Contribution, ContributionHeader, PayloadKind, Reduction};
pub use round::{Phase, RoundKey};
