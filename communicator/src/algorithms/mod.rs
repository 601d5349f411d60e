//! Combination strategies built on the `broadcast` and `aggregate` primitives.
//!
//! Every worker must drive its adapter through the same sequence of rounds, the round ids
//! and model versions are derived from that sequence.

mod fedavg;
mod fedmom;
mod fedprox;

pub use fedavg::FedAvg;
pub use fedmom::FedMom;
pub use fedprox::FedProx;

/// Hands out consecutive round ids.
#[derive(Debug, Clone, Copy)]
struct RoundCounter(u64);

impl RoundCounter {
    fn next(&mut self) -> u64 {
        let round = self.0;
        self.0 += 1;
        round
    }
}
