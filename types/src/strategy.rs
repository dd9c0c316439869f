//! Contribution and reward strategies.
//!
//! Both strategies are closed enums carrying only their own parameters. Computation is an
//! exhaustive `match`, so adding a variant forces every call site to handle it.
//!
//! All arithmetic is done in [`Decimal`]. Pool ratios are rounded to [`RATIO_SCALE`] places on
//! both the contribution and the chance path; contribution amounts are rounded to
//! [`AMOUNT_SCALE`] places. Rounding never pads, so `100.00 * 0.10` stays `10.0000`.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal places kept for pool multipliers, growth and progress ratios.
pub const RATIO_SCALE: u32 = 12;

/// Decimal places kept for contribution amounts.
pub const AMOUNT_SCALE: u32 = 8;

/// Storage discriminant for fixed strategies.
pub const FIXED: &str = "FIXED";

/// Storage discriminant for variable strategies.
pub const VARIABLE: &str = "VARIABLE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("{field} must be within [0, 1] (got {value})")]
    OutOfUnitRange { field: &'static str, value: Decimal },
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: Decimal },
    #[error("min_percentage ({min}) must not exceed initial_percentage ({initial})")]
    MinAboveInitial { min: Decimal, initial: Decimal },
    #[error("max_pool_multiplier must be > 1 (got {value})")]
    MultiplierTooSmall { value: Decimal },
    #[error("initial_pool must be > 0 (got {value})")]
    NonPositivePool { value: Decimal },
    #[error("{field} is required for {kind} strategies")]
    MissingParameter { field: &'static str, kind: &'static str },
    #[error("unsupported {config} type: {value}")]
    UnknownType { config: &'static str, value: String },
}

/// Pool context handed to strategies.
///
/// `initial` is guaranteed positive, which keeps [`Pool::multiplier`] total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pool {
    initial: Decimal,
    current: Decimal,
}

impl Pool {
    pub fn new(initial: Decimal, current: Decimal) -> Result<Self, StrategyError> {
        if initial <= Decimal::ZERO {
            return Err(StrategyError::NonPositivePool { value: initial });
        }
        Ok(Self { initial, current })
    }

    pub fn with_current(self, current: Decimal) -> Self {
        Self { current, ..self }
    }

    pub fn initial(&self) -> Decimal {
        self.initial
    }

    pub fn current(&self) -> Decimal {
        self.current
    }

    /// `current / initial`, rounded to [`RATIO_SCALE`].
    pub fn multiplier(&self) -> Decimal {
        ratio(self.current, self.initial)
    }
}

fn ratio(numerator: Decimal, denominator: Decimal) -> Decimal {
    numerator
        .checked_div(denominator)
        .unwrap_or(Decimal::MAX)
        .round_dp_with_strategy(RATIO_SCALE, RoundingStrategy::MidpointNearestEven)
}

fn ensure_unit(field: &'static str, value: Decimal) -> Result<(), StrategyError> {
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(StrategyError::OutOfUnitRange { field, value });
    }
    Ok(())
}

/// How much of a stake flows into the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContributionStrategy {
    /// A constant share of every stake.
    Fixed { percentage: Decimal },
    /// A share that decays as the pool grows past its initial size, floored at
    /// `min_percentage`.
    Variable {
        initial_percentage: Decimal,
        decay_rate: Decimal,
        min_percentage: Decimal,
    },
}

impl ContributionStrategy {
    pub fn fixed(percentage: Decimal) -> Result<Self, StrategyError> {
        let strategy = Self::Fixed { percentage };
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn variable(
        initial_percentage: Decimal,
        decay_rate: Decimal,
        min_percentage: Decimal,
    ) -> Result<Self, StrategyError> {
        let strategy = Self::Variable {
            initial_percentage,
            decay_rate,
            min_percentage,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            Self::Fixed { percentage } => ensure_unit("percentage", *percentage),
            Self::Variable {
                initial_percentage,
                decay_rate,
                min_percentage,
            } => {
                ensure_unit("initial_percentage", *initial_percentage)?;
                ensure_unit("min_percentage", *min_percentage)?;
                if *decay_rate < Decimal::ZERO {
                    return Err(StrategyError::Negative {
                        field: "decay_rate",
                        value: *decay_rate,
                    });
                }
                if min_percentage > initial_percentage {
                    return Err(StrategyError::MinAboveInitial {
                        min: *min_percentage,
                        initial: *initial_percentage,
                    });
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => FIXED,
            Self::Variable { .. } => VARIABLE,
        }
    }

    /// Share of the stake applied at this pool size.
    pub fn effective_percentage(&self, pool: &Pool) -> Decimal {
        match self {
            Self::Fixed { percentage } => *percentage,
            Self::Variable {
                initial_percentage,
                decay_rate,
                min_percentage,
            } => {
                // Growth is clamped so a drained pool never raises the share.
                let growth = (pool.multiplier() - Decimal::ONE).max(Decimal::ZERO);
                match growth.checked_mul(*decay_rate) {
                    Some(decay) => (*initial_percentage - decay).max(*min_percentage),
                    None => *min_percentage,
                }
            }
        }
    }

    pub fn contribution(&self, pool: &Pool, stake: Decimal) -> Decimal {
        (stake * self.effective_percentage(pool))
            .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointNearestEven)
    }
}

/// Probability that a settled bet wins the whole pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RewardStrategy {
    /// A constant chance regardless of pool size.
    Fixed { chance: Decimal },
    /// Chance rises linearly from `initial_chance` to 1 as the pool grows from its initial
    /// size to `initial * max_pool_multiplier`.
    Variable {
        initial_chance: Decimal,
        max_pool_multiplier: Decimal,
    },
}

impl RewardStrategy {
    pub fn fixed(chance: Decimal) -> Result<Self, StrategyError> {
        let strategy = Self::Fixed { chance };
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn variable(
        initial_chance: Decimal,
        max_pool_multiplier: Decimal,
    ) -> Result<Self, StrategyError> {
        let strategy = Self::Variable {
            initial_chance,
            max_pool_multiplier,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            Self::Fixed { chance } => ensure_unit("chance", *chance),
            Self::Variable {
                initial_chance,
                max_pool_multiplier,
            } => {
                ensure_unit("initial_chance", *initial_chance)?;
                if *max_pool_multiplier <= Decimal::ONE {
                    return Err(StrategyError::MultiplierTooSmall {
                        value: *max_pool_multiplier,
                    });
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => FIXED,
            Self::Variable { .. } => VARIABLE,
        }
    }

    pub fn win_chance(&self, pool: &Pool) -> Decimal {
        match self {
            Self::Fixed { chance } => *chance,
            Self::Variable {
                initial_chance,
                max_pool_multiplier,
            } => {
                let multiplier = pool.multiplier();
                if multiplier <= Decimal::ONE {
                    return *initial_chance;
                }
                let progress =
                    ratio(multiplier - Decimal::ONE, *max_pool_multiplier - Decimal::ONE)
                        .min(Decimal::ONE);
                *initial_chance + (Decimal::ONE - *initial_chance) * progress
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn pool(initial: Decimal, current: Decimal) -> Pool {
        Pool::new(initial, current).expect("positive initial pool")
    }

    fn decaying() -> ContributionStrategy {
        ContributionStrategy::variable(dec!(0.10), dec!(0.02), dec!(0.05)).expect("valid")
    }

    #[test]
    fn fixed_contribution_is_exact_product() {
        let strategy = ContributionStrategy::fixed(dec!(0.10)).expect("valid");
        let amount = strategy.contribution(&pool(dec!(1000.00), dec!(11500.00)), dec!(100.00));
        assert_eq!(amount, dec!(10.0000));
        assert_eq!(amount.scale(), 4);
    }

    #[test]
    fn variable_contribution_at_initial_pool_uses_initial_percentage() {
        let p = pool(dec!(1000.00), dec!(1000.00));
        assert_eq!(decaying().effective_percentage(&p), dec!(0.10));
        assert_eq!(decaying().contribution(&p, dec!(100.00)), dec!(10.00));
    }

    #[test]
    fn variable_contribution_decays_with_growth() {
        let p = pool(dec!(1000.00), dec!(3500.00));
        assert_eq!(decaying().contribution(&p, dec!(100.00)), dec!(5.0000));
    }

    #[test]
    fn variable_contribution_respects_floor() {
        let p = pool(dec!(1000.00), dec!(10000.00));
        assert_eq!(decaying().effective_percentage(&p), dec!(0.05));
        assert_eq!(decaying().contribution(&p, dec!(100.00)), dec!(5.0000));
    }

    #[test]
    fn oversized_decay_falls_to_floor() {
        let steep =
            ContributionStrategy::variable(dec!(0.10), Decimal::MAX, dec!(0.05)).expect("valid");
        let p = pool(dec!(1), Decimal::MAX);
        assert_eq!(steep.effective_percentage(&p), dec!(0.05));
    }

    #[test]
    fn drained_pool_does_not_raise_percentage() {
        let p = pool(dec!(1000.00), dec!(400.00));
        assert_eq!(decaying().effective_percentage(&p), dec!(0.10));
    }

    #[test]
    fn fixed_reward_is_constant() {
        let strategy = RewardStrategy::fixed(dec!(0.05)).expect("valid");
        assert_eq!(strategy.win_chance(&pool(dec!(1000.00), dec!(5000.00))), dec!(0.05));
    }

    #[test]
    fn variable_reward_scales_linearly() {
        let strategy = RewardStrategy::variable(dec!(0.01), dec!(5.00)).expect("valid");
        assert_eq!(
            strategy.win_chance(&pool(dec!(1000.00), dec!(1000.00))),
            dec!(0.01)
        );
        assert_eq!(
            strategy.win_chance(&pool(dec!(1000.00), dec!(3000.00))),
            dec!(0.505)
        );
        assert_eq!(
            strategy.win_chance(&pool(dec!(1000.00), dec!(5000.01))),
            Decimal::ONE
        );
        assert_eq!(
            strategy.win_chance(&pool(dec!(1000.00), dec!(5000.00))),
            Decimal::ONE
        );
    }

    #[test]
    fn variable_reward_below_initial_uses_initial_chance() {
        let strategy = RewardStrategy::variable(dec!(0.01), dec!(5.00)).expect("valid");
        assert_eq!(strategy.win_chance(&pool(dec!(1000.00), dec!(10.00))), dec!(0.01));
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            ContributionStrategy::fixed(dec!(1.5)),
            Err(StrategyError::OutOfUnitRange {
                field: "percentage",
                value: dec!(1.5)
            })
        );
        assert!(matches!(
            ContributionStrategy::variable(dec!(0.05), dec!(0.02), dec!(0.10)),
            Err(StrategyError::MinAboveInitial { .. })
        ));
        assert!(matches!(
            ContributionStrategy::variable(dec!(0.10), dec!(-0.01), dec!(0.05)),
            Err(StrategyError::Negative { field: "decay_rate", .. })
        ));
        assert!(matches!(
            RewardStrategy::variable(dec!(0.01), dec!(1)),
            Err(StrategyError::MultiplierTooSmall { .. })
        ));
        assert!(matches!(
            Pool::new(Decimal::ZERO, dec!(10)),
            Err(StrategyError::NonPositivePool { .. })
        ));
    }

    #[test]
    fn deserializes_tagged_yaml() {
        let strategy: ContributionStrategy = serde_yaml::from_str(
            "type: variable\ninitial_percentage: \"0.10\"\ndecay_rate: \"0.02\"\nmin_percentage: \"0.05\"\n",
        )
        .expect("parse");
        assert_eq!(strategy, decaying());
        let reward: RewardStrategy =
            serde_yaml::from_str("type: fixed\nchance: \"0.01\"\n").expect("parse");
        assert_eq!(reward.kind(), FIXED);
    }

    proptest! {
        #[test]
        fn contribution_percentage_is_non_increasing(a in 0u32..1_000_000, b in 0u32..1_000_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let initial = dec!(1000.00);
            let strategy = decaying();
            let low_pct = strategy.effective_percentage(&pool(initial, Decimal::new(low.into(), 2)));
            let high_pct = strategy.effective_percentage(&pool(initial, Decimal::new(high.into(), 2)));
            prop_assert!(high_pct <= low_pct);
            prop_assert!(high_pct >= dec!(0.05));
        }

        #[test]
        fn win_chance_is_non_decreasing_and_bounded(a in 0u32..10_000_000, b in 0u32..10_000_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let initial = dec!(1000.00);
            let strategy = RewardStrategy::variable(dec!(0.01), dec!(5.00)).expect("valid");
            let low_chance = strategy.win_chance(&pool(initial, Decimal::new(low.into(), 2)));
            let high_chance = strategy.win_chance(&pool(initial, Decimal::new(high.into(), 2)));
            prop_assert!(low_chance <= high_chance);
            prop_assert!(high_chance <= Decimal::ONE);
            prop_assert!(low_chance >= dec!(0.01));
        }
    }
}
