//! Common types used throughout the jackpot workspace.
//!
//! The crate is pure: nothing here touches storage, clocks, or randomness. A jackpot's
//! current pool is always supplied by the caller (the ledger derives it from history),
//! and the only source of chance is the draw closure handed to [`Jackpot::try_to_win`].

pub mod audit;
pub mod jackpot;
pub mod ledger;
pub mod strategy;

pub use jackpot::{Jackpot, NewJackpot};
pub use ledger::{BetId, EntryKind, JackpotId, LedgerEntry, PlacedBet, Settlement, UserId};
pub use strategy::{ContributionStrategy, RewardStrategy, StrategyError};

/// Re-exported so downstream crates agree on a single decimal implementation.
pub use rust_decimal::Decimal;
