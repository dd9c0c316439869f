//! Ledger history replay.
//!
//! The current pool is never stored on its own; it is the `pool_after` of the newest ledger row.
//! [`replay`] recomputes every row from the one before it and reports the first row whose
//! recorded values disagree, so a jackpot's pool can always be rebuilt from history alone.
//!
//! Entries must be supplied in ledger order (creation time, then id).

use rust_decimal::Decimal;
use std::collections::HashSet;
use thiserror::Error;

use crate::ledger::{BetId, EntryKind, JackpotId, LedgerEntry};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("entry {entry_id} belongs to jackpot {got}, expected {expected}")]
    ForeignEntry {
        entry_id: i64,
        expected: JackpotId,
        got: JackpotId,
    },
    #[error("entry {entry_id} is out of order")]
    OutOfOrder { entry_id: i64 },
    #[error("entry {entry_id} ({kind}) records pool {recorded}, replay gives {expected}")]
    PoolMismatch {
        entry_id: i64,
        kind: EntryKind,
        recorded: Decimal,
        expected: Decimal,
    },
    #[error("entry {entry_id} ({kind}) records amount {recorded}, replay gives {expected}")]
    AmountMismatch {
        entry_id: i64,
        kind: EntryKind,
        recorded: Decimal,
        expected: Decimal,
    },
    #[error("contribution entry {entry_id} is negative ({amount})")]
    NegativeContribution { entry_id: i64, amount: Decimal },
    #[error("bet {bet_id} has more than one {kind} entry")]
    Duplicate { bet_id: BetId, kind: &'static str },
    #[error("bet {bet_id} has an outcome before any contribution")]
    OutcomeWithoutContribution { bet_id: BetId },
    #[error("entry {entry_id} overflows the pool")]
    Overflow { entry_id: i64 },
}

/// Recompute the pool over `entries` and return the final value.
pub fn replay(
    jackpot_id: JackpotId,
    initial_pool: Decimal,
    entries: &[LedgerEntry],
) -> Result<Decimal, AuditError> {
    let mut pool = initial_pool;
    let mut contributed = HashSet::new();
    let mut settled = HashSet::new();
    let mut previous: Option<(u64, i64)> = None;

    for entry in entries {
        if entry.jackpot_id != jackpot_id {
            return Err(AuditError::ForeignEntry {
                entry_id: entry.id,
                expected: jackpot_id,
                got: entry.jackpot_id,
            });
        }
        let position = (entry.created_at_ms, entry.id);
        if previous.is_some_and(|prev| prev >= position) {
            return Err(AuditError::OutOfOrder { entry_id: entry.id });
        }
        previous = Some(position);

        let (expected_amount, expected_pool) = match entry.kind {
            EntryKind::Contribution => {
                if !contributed.insert(entry.bet_id) {
                    return Err(AuditError::Duplicate {
                        bet_id: entry.bet_id,
                        kind: "contribution",
                    });
                }
                if entry.contribution_amount < Decimal::ZERO {
                    return Err(AuditError::NegativeContribution {
                        entry_id: entry.id,
                        amount: entry.contribution_amount,
                    });
                }
                let after = pool
                    .checked_add(entry.contribution_amount)
                    .ok_or(AuditError::Overflow { entry_id: entry.id })?;
                (entry.contribution_amount, after)
            }
            EntryKind::Reward | EntryKind::Unrewarded => {
                if !contributed.contains(&entry.bet_id) {
                    return Err(AuditError::OutcomeWithoutContribution {
                        bet_id: entry.bet_id,
                    });
                }
                if !settled.insert(entry.bet_id) {
                    return Err(AuditError::Duplicate {
                        bet_id: entry.bet_id,
                        kind: "outcome",
                    });
                }
                if entry.kind == EntryKind::Reward {
                    (-pool, initial_pool)
                } else {
                    (Decimal::ZERO, pool)
                }
            }
        };

        if entry.contribution_amount != expected_amount {
            return Err(AuditError::AmountMismatch {
                entry_id: entry.id,
                kind: entry.kind,
                recorded: entry.contribution_amount,
                expected: expected_amount,
            });
        }
        if entry.pool_after != expected_pool {
            return Err(AuditError::PoolMismatch {
                entry_id: entry.id,
                kind: entry.kind,
                recorded: entry.pool_after,
                expected: expected_pool,
            });
        }
        pool = expected_pool;
    }

    Ok(pool)
}
