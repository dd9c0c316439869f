//! Bet placement and settlement.
//!
//! [`BetService`] is the only entry point a transport or queue consumer needs. It wraps each
//! request in a single ledger transaction and turns duplicate writes into idempotent replies:
//!
//! ```rust,ignore
//! use jackpot_execution::{BetService, UniformDraw};
//! use jackpot_ledger::SqliteLedger;
//!
//! let service = BetService::new(SqliteLedger::open(path)?, UniformDraw);
//! service.place_bet(&bet)?;
//! let settlement = service.settle_reward(bet.bet_id)?;
//! ```

pub mod random;
pub mod settlement;

#[cfg(any(test, feature = "mocks"))]
pub use random::fixed::FixedDraw;
pub use random::{RandomSource, SeededDraw, UniformDraw};
pub use settlement::{BetService, PlaceBetOutcome, SettlementError};
