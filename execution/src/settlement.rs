use jackpot_ledger::{LedgerStore, Lookup, StoreError};
use jackpot_types::{BetId, EntryKind, JackpotId, LedgerEntry, PlacedBet, Settlement, StrategyError};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::random::RandomSource;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("no jackpot found for {0}")]
    NotFound(Lookup),
    #[error("bet {bet_id} has unacceptable amount {amount}")]
    InvalidAmount { bet_id: BetId, amount: Decimal },
    #[error("jackpot {jackpot_id} has invalid configuration")]
    InvalidConfiguration {
        jackpot_id: JackpotId,
        #[source]
        source: StrategyError,
    },
    #[error("bet {bet_id} has no contribution to settle against")]
    IntegrityPrerequisiteMissing { bet_id: BetId },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingContribution { bet_id } => {
                Self::IntegrityPrerequisiteMissing { bet_id }
            }
            StoreError::InvalidConfiguration { jackpot_id, source } => {
                Self::InvalidConfiguration { jackpot_id, source }
            }
            other => Self::Store(other),
        }
    }
}

impl SettlementError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaceBetOutcome {
    Contributed(LedgerEntry),
    /// The bet already has a contribution; nothing was written.
    AlreadyProcessed,
}

/// Places and settles bets against a ledger.
///
/// Each call is one unit of work: load the jackpot, compute, append one entry. Duplicate
/// deliveries are absorbed here. A repeated `place_bet` reports
/// [`PlaceBetOutcome::AlreadyProcessed`], and a repeated `settle_reward` returns the outcome
/// that was recorded first.
pub struct BetService<S, R> {
    store: S,
    random: R,
}

impl<S: LedgerStore, R: RandomSource> BetService<S, R> {
    pub fn new(store: S, random: R) -> Self {
        Self { store, random }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn place_bet(&self, bet: &PlacedBet) -> Result<PlaceBetOutcome, SettlementError> {
        if bet.amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount {
                bet_id: bet.bet_id,
                amount: bet.amount,
            });
        }

        let placed = self.store.transaction(|tx| -> Result<LedgerEntry, SettlementError> {
            let jackpot = tx
                .find_by_id(bet.jackpot_id)?
                .ok_or(SettlementError::NotFound(Lookup::Id(bet.jackpot_id)))?;
            let contribution = jackpot.calculate_contribution(bet.amount);
            tx.insert_contribution(bet.bet_id, bet.user_id, &jackpot, bet.amount, contribution)
                .map_err(|err| match err {
                    StoreError::PoolOverflow { bet_id, .. } => SettlementError::InvalidAmount {
                        bet_id,
                        amount: bet.amount,
                    },
                    other => other.into(),
                })
        });

        match placed {
            Ok(entry) => {
                info!(
                    bet_id = entry.bet_id,
                    user_id = entry.user_id,
                    jackpot_id = entry.jackpot_id,
                    stake = %entry.stake_amount,
                    contribution = %entry.contribution_amount,
                    pool = %entry.pool_after,
                    "contributed to jackpot"
                );
                Ok(PlaceBetOutcome::Contributed(entry))
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    bet_id = bet.bet_id,
                    jackpot_id = bet.jackpot_id,
                    "bet already processed"
                );
                Ok(PlaceBetOutcome::AlreadyProcessed)
            }
            Err(err) => Err(err),
        }
    }

    /// Decide whether the bet wins its jackpot.
    ///
    /// The draw happens once per call. When another call has already recorded an outcome, that
    /// outcome is returned unchanged.
    pub fn settle_reward(&self, bet_id: BetId) -> Result<Settlement, SettlementError> {
        let settled = self.store.transaction(|tx| -> Result<Settlement, SettlementError> {
            let jackpot = tx
                .find_by_bet_id(bet_id)?
                .ok_or(SettlementError::NotFound(Lookup::Bet(bet_id)))?;
            match jackpot.try_to_win(|| self.random.draw()) {
                Some(reward) => {
                    tx.insert_reward(bet_id, &jackpot, reward)?;
                    Ok(Settlement::won(bet_id, reward))
                }
                None => {
                    tx.insert_unrewarded(bet_id, &jackpot)?;
                    Ok(Settlement::lost(bet_id))
                }
            }
        });

        match settled {
            Ok(settlement) => {
                info!(
                    bet_id,
                    won = settlement.won,
                    reward = ?settlement.reward,
                    "settled bet"
                );
                Ok(settlement)
            }
            Err(err) if err.is_conflict() => {
                let recorded = self.recorded_outcome(bet_id, err)?;
                warn!(bet_id, won = recorded.won, "bet already settled");
                Ok(recorded)
            }
            Err(err) => Err(err),
        }
    }

    /// Outcome written by an earlier settlement, looking for a reward before a loss.
    fn recorded_outcome(
        &self,
        bet_id: BetId,
        conflict: SettlementError,
    ) -> Result<Settlement, SettlementError> {
        self.store.transaction(|tx| -> Result<Settlement, SettlementError> {
            if let Some(reward) = tx.find_contribution(bet_id, EntryKind::Reward)? {
                return Ok(Settlement::won(bet_id, -reward.contribution_amount));
            }
            if tx
                .find_contribution(bet_id, EntryKind::Unrewarded)?
                .is_some()
            {
                return Ok(Settlement::lost(bet_id));
            }
            Err(conflict)
        })
    }
}
