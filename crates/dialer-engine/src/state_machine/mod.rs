pub mod executor;
pub mod stats;

pub use executor::{CallStateMachine, TransitionData, TransitionKind, TransitionResult};
pub use stats::{TransitionStats, TransitionStatsSnapshot};
