//! Engine services: market creation, bet placement and settlement.

pub mod betting;
pub mod creation;
pub mod settlement;

pub use betting::{BettingService, PlacedBet};
pub use creation::{CreatedMarket, MarketCreator};
pub use settlement::{BatchItem, BatchReport, FinalizeOutcome, SettlementOrchestrator};
