mod momentum;
mod numeric;
pub mod ops;
mod policy;

pub use momentum::Momentum;
pub use policy::Reducer;

pub use comms::specs::Reduction;
