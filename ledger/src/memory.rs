use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use jackpot_types::{BetId, EntryKind, Jackpot, JackpotId, LedgerEntry, NewJackpot};
use rust_decimal::Decimal;

use crate::{
    ContributionRow, JackpotRecord, LedgerStore, LedgerTx, Lookup, NewEntry, RewardRow,
    StoreError,
};

#[derive(Clone, Default)]
struct State {
    jackpots: BTreeMap<JackpotId, JackpotRecord>,
    entries: Vec<LedgerEntry>,
    next_jackpot_id: JackpotId,
    next_entry_id: i64,
    clock_ms: u64,
}

/// In-memory ledger with the same uniqueness rules as the SQL stores.
///
/// Transactions run one at a time against a copy of the state and replace it only on commit.
/// Timestamps come from a logical clock that ticks once per row.
#[derive(Default)]
pub struct Memory {
    state: Mutex<State>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every committed entry in insertion order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }
}

impl LedgerStore for Memory {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut committed = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut tx = MemoryTx {
            state: committed.clone(),
        };
        let value = f(&mut tx)?;
        *committed = tx.state;
        Ok(value)
    }
}

struct MemoryTx {
    state: State,
}

impl LedgerTx for MemoryTx {
    fn jackpot_record(&mut self, lookup: Lookup) -> Result<Option<JackpotRecord>, StoreError> {
        let jackpot_id = match lookup {
            Lookup::Id(id) => Some(id),
            Lookup::Bet(bet_id) => self
                .state
                .entries
                .iter()
                .find(|entry| entry.bet_id == bet_id && entry.kind == EntryKind::Contribution)
                .map(|entry| entry.jackpot_id),
        };
        Ok(jackpot_id.and_then(|id| self.state.jackpots.get(&id).cloned()))
    }

    fn latest_pool(&mut self, jackpot_id: JackpotId) -> Result<Option<Decimal>, StoreError> {
        Ok(self
            .state
            .entries
            .iter()
            .filter(|entry| entry.jackpot_id == jackpot_id)
            .max_by_key(|entry| (entry.created_at_ms, entry.id))
            .map(|entry| entry.pool_after))
    }

    fn append(&mut self, entry: NewEntry) -> Result<LedgerEntry, StoreError> {
        if !self.state.jackpots.contains_key(&entry.jackpot_id) {
            return Err(StoreError::Corrupt {
                column: "jackpot_contribution.jackpot_id",
                value: entry.jackpot_id.to_string(),
            });
        }
        let conflict = self.state.entries.iter().any(|existing| {
            existing.bet_id == entry.bet_id
                && (existing.kind == entry.kind
                    || (existing.kind.is_outcome() && entry.kind.is_outcome()))
        });
        if conflict {
            return Err(StoreError::Conflict {
                bet_id: entry.bet_id,
                kind: entry.kind,
            });
        }

        self.state.next_entry_id += 1;
        self.state.clock_ms += 1;
        let entry = entry.into_entry(self.state.next_entry_id, self.state.clock_ms);
        self.state.entries.push(entry.clone());
        Ok(entry)
    }

    fn find_contribution(
        &mut self,
        bet_id: BetId,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .state
            .entries
            .iter()
            .find(|entry| entry.bet_id == bet_id && entry.kind == kind)
            .cloned())
    }

    fn history(&mut self, jackpot_id: JackpotId) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .state
            .entries
            .iter()
            .filter(|entry| entry.jackpot_id == jackpot_id)
            .cloned()
            .collect())
    }

    fn create_jackpot(&mut self, jackpot: &NewJackpot) -> Result<Jackpot, StoreError> {
        jackpot
            .validate()
            .map_err(|source| StoreError::InvalidConfiguration {
                jackpot_id: jackpot.id.unwrap_or_default(),
                source,
            })?;
        let id = match jackpot.id {
            Some(id) if self.state.jackpots.contains_key(&id) => {
                return Err(StoreError::JackpotExists { jackpot_id: id })
            }
            Some(id) => id,
            None => self.state.next_jackpot_id + 1,
        };
        self.state.next_jackpot_id = self.state.next_jackpot_id.max(id);
        self.state.clock_ms += 1;

        let record = JackpotRecord {
            id,
            initial_pool: jackpot.initial_pool,
            created_at_ms: self.state.clock_ms,
            contribution: ContributionRow::from(&jackpot.contribution),
            reward: RewardRow::from(&jackpot.reward),
        };
        self.state.jackpots.insert(id, record.clone());
        record.into_jackpot(jackpot.initial_pool)
    }
}
