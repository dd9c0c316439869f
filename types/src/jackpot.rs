use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::JackpotId;
use crate::strategy::{ContributionStrategy, Pool, RewardStrategy, StrategyError};

/// A jackpot as seen at one point of its ledger history.
///
/// `current_pool` is a projection of the ledger and is never written back; stores build a
/// `Jackpot` by deriving the pool and calling [`Jackpot::with_current_pool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Jackpot {
    id: JackpotId,
    pool: Pool,
    created_at_ms: u64,
    contribution: ContributionStrategy,
    reward: RewardStrategy,
}

impl Jackpot {
    pub fn new(
        id: JackpotId,
        initial_pool: Decimal,
        current_pool: Decimal,
        created_at_ms: u64,
        contribution: ContributionStrategy,
        reward: RewardStrategy,
    ) -> Result<Self, StrategyError> {
        contribution.validate()?;
        reward.validate()?;
        Ok(Self {
            id,
            pool: Pool::new(initial_pool, current_pool)?,
            created_at_ms,
            contribution,
            reward,
        })
    }

    pub fn id(&self) -> JackpotId {
        self.id
    }

    pub fn initial_pool(&self) -> Decimal {
        self.pool.initial()
    }

    pub fn current_pool(&self) -> Decimal {
        self.pool.current()
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn contribution_strategy(&self) -> &ContributionStrategy {
        &self.contribution
    }

    pub fn reward_strategy(&self) -> &RewardStrategy {
        &self.reward
    }

    /// The same jackpot projected at a different pool value.
    pub fn with_current_pool(mut self, current_pool: Decimal) -> Self {
        self.pool = self.pool.with_current(current_pool);
        self
    }

    pub fn calculate_contribution(&self, stake: Decimal) -> Decimal {
        self.contribution.contribution(&self.pool, stake)
    }

    pub fn calculate_reward_chance(&self) -> Decimal {
        self.reward.win_chance(&self.pool)
    }

    /// Attempt to win the jackpot.
    ///
    /// `draw` is called exactly once and must yield a value in `[0, 1)`. A draw strictly below
    /// the current chance wins the whole current pool; a draw equal to the chance loses.
    pub fn try_to_win(&self, draw: impl FnOnce() -> Decimal) -> Option<Decimal> {
        if draw() < self.calculate_reward_chance() {
            Some(self.current_pool())
        } else {
            None
        }
    }
}

/// Definition used to seed a jackpot into a store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJackpot {
    /// Explicit id; stores assign one when absent.
    #[serde(default)]
    pub id: Option<JackpotId>,
    pub initial_pool: Decimal,
    pub contribution: ContributionStrategy,
    pub reward: RewardStrategy,
}

impl NewJackpot {
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.initial_pool <= Decimal::ZERO {
            return Err(StrategyError::NonPositivePool {
                value: self.initial_pool,
            });
        }
        self.contribution.validate()?;
        self.reward.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn jackpot(current: Decimal, chance: Decimal) -> Jackpot {
        Jackpot::new(
            1,
            dec!(1000.00),
            current,
            0,
            ContributionStrategy::fixed(dec!(0.10)).expect("valid"),
            RewardStrategy::fixed(chance).expect("valid"),
        )
        .expect("valid jackpot")
    }

    #[test]
    fn contribution_delegates_to_strategy() {
        assert_eq!(
            jackpot(dec!(1000.00), dec!(0.05)).calculate_contribution(dec!(100.00)),
            dec!(10.0000)
        );
    }

    #[test]
    fn draw_above_chance_loses() {
        assert_eq!(jackpot(dec!(2000.00), dec!(0.01)).try_to_win(|| dec!(0.02)), None);
    }

    #[test]
    fn draw_below_chance_wins_current_pool() {
        assert_eq!(
            jackpot(dec!(2000.00), dec!(0.01)).try_to_win(|| dec!(0.005)),
            Some(dec!(2000.00))
        );
        assert_eq!(
            jackpot(dec!(2000.00), dec!(0.01)).try_to_win(|| dec!(0.009999999999)),
            Some(dec!(2000.00))
        );
    }

    #[test]
    fn draw_equal_to_chance_loses() {
        assert_eq!(jackpot(dec!(2000.00), dec!(0.01)).try_to_win(|| dec!(0.01)), None);
    }

    #[test]
    fn draw_is_called_once() {
        let mut calls = 0;
        jackpot(dec!(2000.00), dec!(0.01)).try_to_win(|| {
            calls += 1;
            dec!(0.5)
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn rejects_non_positive_initial_pool() {
        let result = Jackpot::new(
            1,
            Decimal::ZERO,
            Decimal::ZERO,
            0,
            ContributionStrategy::fixed(dec!(0.10)).expect("valid"),
            RewardStrategy::fixed(dec!(0.01)).expect("valid"),
        );
        assert_eq!(
            result,
            Err(StrategyError::NonPositivePool {
                value: Decimal::ZERO
            })
        );
    }

    #[test]
    fn projection_keeps_initial_pool() {
        let projected = jackpot(dec!(1000.00), dec!(0.01)).with_current_pool(dec!(1010.00));
        assert_eq!(projected.initial_pool(), dec!(1000.00));
        assert_eq!(projected.current_pool(), dec!(1010.00));
    }
}
