//! Prediction markets: scenario lifecycle, stake escrow and settlement.

pub mod payout;
pub mod resolver;
pub mod scenario;

pub use payout::UnfulfilledPolicy;
pub use resolver::{MarketResolver, PlacedPrediction, Resolution, StealOutcome};
pub use scenario::{Payout, PayoutStatus, Prediction, PredictionStatus, Scenario, ScenarioStatus, Side};
