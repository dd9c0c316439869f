//! Append-only jackpot ledger.
//!
//! Every write is a new `jackpot_contribution` row; nothing is updated or deleted. A jackpot's
//! current pool is read back from the newest row (falling back to its initial pool), so the
//! ledger is the only system of record.
//!
//! Exactly-once semantics come from the backing store. Each bet may hold one `CONTRIBUTION` row
//! (`UNIQUE (bet_id, type)`) and one outcome row (a partial unique index over `REWARD` and
//! `UNREWARDED`). A duplicate write surfaces as [`StoreError::Conflict`], which callers treat as
//! "already applied" rather than as a failure.
//!
//! Stores hand out an explicit transaction handle through [`LedgerStore::transaction`]. The
//! unit of work commits only when the closure returns `Ok`; any error rolls it back.

use jackpot_types::{
    strategy::{FIXED, VARIABLE},
    BetId, ContributionStrategy, EntryKind, Jackpot, JackpotId, LedgerEntry, NewJackpot,
    RewardStrategy, StrategyError, UserId,
};
use rust_decimal::Decimal;
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

#[cfg(any(test, feature = "mocks"))]
mod memory;
#[cfg(any(test, feature = "mocks"))]
pub use memory::Memory;
mod pg;
pub use pg::{validate_postgres_url, PostgresLedger};
mod sqlite;
pub use sqlite::SqliteLedger;


#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} entry for bet_id={bet_id} conflicts with an existing entry")]
    Conflict { bet_id: BetId, kind: EntryKind },
    #[error("no contribution found for bet_id={bet_id}")]
    MissingContribution { bet_id: BetId },
    #[error("negative contribution {amount} for bet_id={bet_id}")]
    NegativeContribution { bet_id: BetId, amount: Decimal },
    #[error("contribution {amount} for bet_id={bet_id} overflows jackpot {jackpot_id}")]
    PoolOverflow {
        bet_id: BetId,
        jackpot_id: JackpotId,
        amount: Decimal,
    },
    #[error("jackpot {jackpot_id} has invalid configuration")]
    InvalidConfiguration {
        jackpot_id: JackpotId,
        #[source]
        source: StrategyError,
    },
    #[error("jackpot {jackpot_id} already exists")]
    JackpotExists { jackpot_id: JackpotId },
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("invalid postgres url: {0}")]
    InvalidUrl(String),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
}

/// Source of transaction handles.
pub trait LedgerStore: Send + Sync {
    /// Run `f` as one unit of work.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>;
}

/// How a jackpot is located.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Id(JackpotId),
    /// The jackpot the bet contributed to.
    Bet(BetId),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(jackpot_id) => write!(f, "jackpot_id={jackpot_id}"),
            Self::Bet(bet_id) => write!(f, "bet_id={bet_id}"),
        }
    }
}

/// Persisted strategy parameters of a `contribution_config` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContributionRow {
    pub kind: String,
    pub percentage: Option<Decimal>,
    pub initial_percentage: Option<Decimal>,
    pub decay_rate: Option<Decimal>,
    pub min_percentage: Option<Decimal>,
}

impl ContributionRow {
    pub fn into_strategy(self) -> Result<ContributionStrategy, StrategyError> {
        match self.kind.as_str() {
            FIXED => ContributionStrategy::fixed(required(self.percentage, "percentage", FIXED)?),
            VARIABLE => ContributionStrategy::variable(
                required(self.initial_percentage, "variable_initial_percentage", VARIABLE)?,
                required(self.decay_rate, "variable_decay_rate", VARIABLE)?,
                required(self.min_percentage, "min_percentage", VARIABLE)?,
            ),
            _ => Err(StrategyError::UnknownType {
                config: "contribution_config",
                value: self.kind,
            }),
        }
    }
}

impl From<&ContributionStrategy> for ContributionRow {
    fn from(strategy: &ContributionStrategy) -> Self {
        match strategy {
            ContributionStrategy::Fixed { percentage } => Self {
                kind: FIXED.to_string(),
                percentage: Some(*percentage),
                ..Self::default()
            },
            ContributionStrategy::Variable {
                initial_percentage,
                decay_rate,
                min_percentage,
            } => Self {
                kind: VARIABLE.to_string(),
                initial_percentage: Some(*initial_percentage),
                decay_rate: Some(*decay_rate),
                min_percentage: Some(*min_percentage),
                ..Self::default()
            },
        }
    }
}

/// Persisted strategy parameters of a `reward_config` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewardRow {
    pub kind: String,
    pub chance: Option<Decimal>,
    pub initial_chance: Option<Decimal>,
    pub max_pool_multiplier: Option<Decimal>,
}

impl RewardRow {
    pub fn into_strategy(self) -> Result<RewardStrategy, StrategyError> {
        match self.kind.as_str() {
            FIXED => RewardStrategy::fixed(required(self.chance, "chance", FIXED)?),
            VARIABLE => RewardStrategy::variable(
                required(self.initial_chance, "initial_chance", VARIABLE)?,
                required(self.max_pool_multiplier, "max_pool_multiplier", VARIABLE)?,
            ),
            _ => Err(StrategyError::UnknownType {
                config: "reward_config",
                value: self.kind,
            }),
        }
    }
}

impl From<&RewardStrategy> for RewardRow {
    fn from(strategy: &RewardStrategy) -> Self {
        match strategy {
            RewardStrategy::Fixed { chance } => Self {
                kind: FIXED.to_string(),
                chance: Some(*chance),
                ..Self::default()
            },
            RewardStrategy::Variable {
                initial_chance,
                max_pool_multiplier,
            } => Self {
                kind: VARIABLE.to_string(),
                initial_chance: Some(*initial_chance),
                max_pool_multiplier: Some(*max_pool_multiplier),
                ..Self::default()
            },
        }
    }
}

fn required(
    value: Option<Decimal>,
    field: &'static str,
    kind: &'static str,
) -> Result<Decimal, StrategyError> {
    value.ok_or(StrategyError::MissingParameter { field, kind })
}

/// A `jackpot` row joined with its two strategy rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JackpotRecord {
    pub id: JackpotId,
    pub initial_pool: Decimal,
    pub created_at_ms: u64,
    pub contribution: ContributionRow,
    pub reward: RewardRow,
}

impl JackpotRecord {
    /// Build the aggregate at `current_pool`, validating the stored strategies.
    pub fn into_jackpot(self, current_pool: Decimal) -> Result<Jackpot, StoreError> {
        let jackpot_id = self.id;
        let invalid = |source| StoreError::InvalidConfiguration { jackpot_id, source };
        let contribution = self.contribution.into_strategy().map_err(invalid)?;
        let reward = self.reward.into_strategy().map_err(invalid)?;
        Jackpot::new(
            self.id,
            self.initial_pool,
            current_pool,
            self.created_at_ms,
            contribution,
            reward,
        )
        .map_err(invalid)
    }
}

/// A ledger row before the store assigns its id and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEntry {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub jackpot_id: JackpotId,
    pub kind: EntryKind,
    pub stake_amount: Decimal,
    pub contribution_amount: Decimal,
    pub pool_after: Decimal,
}

impl NewEntry {
    /// Derive the row for `kind` against the jackpot's current pool.
    ///
    /// Contributions add to the pool, rewards reset it to the initial pool, and unrewarded
    /// outcomes leave it unchanged. Fails when the contribution would overflow the pool.
    pub fn new(
        kind: EntryKind,
        bet_id: BetId,
        user_id: UserId,
        jackpot: &Jackpot,
        stake_amount: Decimal,
        contribution_amount: Decimal,
    ) -> Result<Self, StoreError> {
        let pool_after = match kind {
            EntryKind::Contribution => jackpot
                .current_pool()
                .checked_add(contribution_amount)
                .ok_or(StoreError::PoolOverflow {
                    bet_id,
                    jackpot_id: jackpot.id(),
                    amount: contribution_amount,
                })?,
            EntryKind::Reward => jackpot.initial_pool(),
            EntryKind::Unrewarded => jackpot.current_pool(),
        };
        Ok(Self {
            bet_id,
            user_id,
            jackpot_id: jackpot.id(),
            kind,
            stake_amount,
            contribution_amount,
            pool_after,
        })
    }

    pub fn into_entry(self, id: i64, created_at_ms: u64) -> LedgerEntry {
        LedgerEntry {
            id,
            bet_id: self.bet_id,
            user_id: self.user_id,
            jackpot_id: self.jackpot_id,
            kind: self.kind,
            stake_amount: self.stake_amount,
            contribution_amount: self.contribution_amount,
            pool_after: self.pool_after,
            created_at_ms,
        }
    }
}

/// Operations available inside one ledger transaction.
///
/// Backends implement the row-level hooks; the ledger semantics (pool derivation, prerequisite
/// checks, entry shapes) are provided once on top of them.
pub trait LedgerTx {
    /// Load a jackpot row and its strategy rows.
    fn jackpot_record(&mut self, lookup: Lookup) -> Result<Option<JackpotRecord>, StoreError>;

    /// `pool_after` of the newest entry for the jackpot, ordered by creation time then id.
    fn latest_pool(&mut self, jackpot_id: JackpotId) -> Result<Option<Decimal>, StoreError>;

    /// Insert a row. Must fail with [`StoreError::Conflict`] on a uniqueness violation.
    fn append(&mut self, entry: NewEntry) -> Result<LedgerEntry, StoreError>;

    /// Point lookup of a bet's entry of the given kind.
    fn find_contribution(
        &mut self,
        bet_id: BetId,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// All entries of a jackpot in ledger order.
    fn history(&mut self, jackpot_id: JackpotId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Seed a jackpot and its strategy rows.
    fn create_jackpot(&mut self, jackpot: &NewJackpot) -> Result<Jackpot, StoreError>;

    fn find_by_id(&mut self, jackpot_id: JackpotId) -> Result<Option<Jackpot>, StoreError> {
        self.find(Lookup::Id(jackpot_id))
    }

    fn find_by_bet_id(&mut self, bet_id: BetId) -> Result<Option<Jackpot>, StoreError> {
        self.find(Lookup::Bet(bet_id))
    }

    fn find(&mut self, lookup: Lookup) -> Result<Option<Jackpot>, StoreError> {
        let Some(record) = self.jackpot_record(lookup)? else {
            return Ok(None);
        };
        let current_pool = self
            .latest_pool(record.id)?
            .unwrap_or(record.initial_pool);
        record.into_jackpot(current_pool).map(Some)
    }

    fn insert_contribution(
        &mut self,
        bet_id: BetId,
        user_id: UserId,
        jackpot: &Jackpot,
        stake_amount: Decimal,
        contribution_amount: Decimal,
    ) -> Result<LedgerEntry, StoreError> {
        if contribution_amount < Decimal::ZERO {
            return Err(StoreError::NegativeContribution {
                bet_id,
                amount: contribution_amount,
            });
        }
        self.append(NewEntry::new(
            EntryKind::Contribution,
            bet_id,
            user_id,
            jackpot,
            stake_amount,
            contribution_amount,
        )?)
    }

    /// Record a win: the payout is withdrawn and the pool resets to its initial value.
    fn insert_reward(
        &mut self,
        bet_id: BetId,
        jackpot: &Jackpot,
        reward_amount: Decimal,
    ) -> Result<LedgerEntry, StoreError> {
        let user_id = self.contributor(bet_id)?;
        self.append(NewEntry::new(
            EntryKind::Reward,
            bet_id,
            user_id,
            jackpot,
            Decimal::ZERO,
            -reward_amount,
        )?)
    }

    /// Record a bet that did not win. The row keeps the pool unchanged and blocks any later
    /// reward for the same bet.
    fn insert_unrewarded(
        &mut self,
        bet_id: BetId,
        jackpot: &Jackpot,
    ) -> Result<LedgerEntry, StoreError> {
        let user_id = self.contributor(bet_id)?;
        self.append(NewEntry::new(
            EntryKind::Unrewarded,
            bet_id,
            user_id,
            jackpot,
            Decimal::ZERO,
            Decimal::ZERO,
        )?)
    }

    /// User that placed the bet, taken from its contribution row.
    fn contributor(&mut self, bet_id: BetId) -> Result<UserId, StoreError> {
        self.find_contribution(bet_id, EntryKind::Contribution)?
            .map(|entry| entry.user_id)
            .ok_or(StoreError::MissingContribution { bet_id })
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
