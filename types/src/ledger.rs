use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::strategy::StrategyError;

pub type BetId = i64;
pub type UserId = i64;
pub type JackpotId = i64;

/// Type of a ledger row.
///
/// `Reward` and `Unrewarded` form the outcome class: a bet has at most one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Contribution,
    Reward,
    Unrewarded,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contribution => "CONTRIBUTION",
            Self::Reward => "REWARD",
            Self::Unrewarded => "UNREWARDED",
        }
    }

    pub fn is_outcome(&self) -> bool {
        matches!(self, Self::Reward | Self::Unrewarded)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = StrategyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "CONTRIBUTION" => Ok(Self::Contribution),
            "REWARD" => Ok(Self::Reward),
            "UNREWARDED" => Ok(Self::Unrewarded),
            other => Err(StrategyError::UnknownType {
                config: "jackpot_contribution",
                value: other.to_string(),
            }),
        }
    }
}

/// One immutable row of the jackpot ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub bet_id: BetId,
    pub user_id: UserId,
    pub jackpot_id: JackpotId,
    pub kind: EntryKind,
    pub stake_amount: Decimal,
    /// Positive for contributions, negated payout for rewards, zero otherwise.
    pub contribution_amount: Decimal,
    pub pool_after: Decimal,
    pub created_at_ms: u64,
}

/// A bet as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedBet {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub jackpot_id: JackpotId,
    pub amount: Decimal,
}

/// Definitive outcome of settling a bet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub bet_id: BetId,
    pub won: bool,
    pub reward: Option<Decimal>,
}

impl Settlement {
    pub fn won(bet_id: BetId, reward: Decimal) -> Self {
        Self {
            bet_id,
            won: true,
            reward: Some(reward),
        }
    }

    pub fn lost(bet_id: BetId) -> Self {
        Self {
            bet_id,
            won: false,
            reward: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn kind_parses_storage_names() {
        for kind in [EntryKind::Contribution, EntryKind::Reward, EntryKind::Unrewarded] {
            assert_eq!(kind.as_str().parse::<EntryKind>(), Ok(kind));
        }
        assert!("PAYOUT".parse::<EntryKind>().is_err());
        assert!(!EntryKind::Contribution.is_outcome());
        assert!(EntryKind::Unrewarded.is_outcome());
    }

    #[test]
    fn placed_bet_decodes_from_json() {
        let bet: PlacedBet = serde_json::from_str(
            r#"{"bet_id":123,"user_id":456,"jackpot_id":1,"amount":"100.00"}"#,
        )
        .expect("decode");
        assert_eq!(bet.amount, dec!(100.00));
        assert_eq!(bet.jackpot_id, 1);
    }

    #[test]
    fn settlement_serializes_reward_as_string() {
        let json = serde_json::to_string(&Settlement::won(7, dec!(2000.00))).expect("encode");
        assert_eq!(json, r#"{"bet_id":7,"won":true,"reward":"2000.00"}"#);
    }
}
