use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use jackpot_types::{BetId, EntryKind, Jackpot, JackpotId, LedgerEntry, NewJackpot};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior,
};
use rust_decimal::Decimal;
use tracing::debug;

use crate::{
    now_ms, ContributionRow, JackpotRecord, LedgerStore, LedgerTx, Lookup, NewEntry, RewardRow,
    StoreError,
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     CREATE TABLE IF NOT EXISTS contribution_config (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         type TEXT NOT NULL CHECK (type IN ('FIXED', 'VARIABLE')),
         percentage TEXT,
         variable_initial_percentage TEXT,
         variable_decay_rate TEXT,
         min_percentage TEXT,
         created_at INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS reward_config (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         type TEXT NOT NULL CHECK (type IN ('FIXED', 'VARIABLE')),
         chance TEXT,
         initial_chance TEXT,
         max_pool_multiplier TEXT,
         created_at INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS jackpot (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         initial_pool TEXT NOT NULL,
         contribution_config_id INTEGER NOT NULL REFERENCES contribution_config (id),
         reward_config_id INTEGER NOT NULL REFERENCES reward_config (id),
         created_at INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS jackpot_contribution (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         bet_id INTEGER NOT NULL,
         user_id INTEGER NOT NULL,
         jackpot_id INTEGER NOT NULL REFERENCES jackpot (id),
         type TEXT NOT NULL CHECK (type IN ('CONTRIBUTION', 'REWARD', 'UNREWARDED')),
         stake_amount TEXT NOT NULL,
         contribution_amount TEXT NOT NULL,
         jackpot_amount_after TEXT NOT NULL,
         created_at INTEGER NOT NULL,
         UNIQUE (bet_id, type)
     );
     CREATE UNIQUE INDEX IF NOT EXISTS jackpot_contribution_outcome
         ON jackpot_contribution (bet_id) WHERE type IN ('REWARD', 'UNREWARDED');
     CREATE INDEX IF NOT EXISTS jackpot_contribution_tail
         ON jackpot_contribution (jackpot_id, created_at DESC, id DESC);";

const SELECT_JACKPOT: &str = "SELECT j.id, j.initial_pool, j.created_at,
            c.type, c.percentage, c.variable_initial_percentage, c.variable_decay_rate,
            c.min_percentage, r.type, r.chance, r.initial_chance, r.max_pool_multiplier
     FROM jackpot j
     JOIN contribution_config c ON c.id = j.contribution_config_id
     JOIN reward_config r ON r.id = j.reward_config_id";

const SELECT_ENTRY: &str = "SELECT id, bet_id, user_id, jackpot_id, type, stake_amount,
            contribution_amount, jackpot_amount_after, created_at
     FROM jackpot_contribution";

/// Ledger stored in a single SQLite file.
///
/// Every transaction opens its own connection and starts `IMMEDIATE`, so writers are serialized
/// by the database lock and a contribution always sees the pool left by the previous one.
pub struct SqliteLedger {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open (creating the schema if needed) with a custom lock wait.
    pub fn with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let ledger = Self {
            path: path.to_path_buf(),
            busy_timeout,
        };
        ledger.connect()?.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened sqlite ledger");
        Ok(ledger)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }
}

impl LedgerStore for SqliteLedger {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&mut SqliteTx { conn: &tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl LedgerTx for SqliteTx<'_> {
    fn jackpot_record(&mut self, lookup: Lookup) -> Result<Option<JackpotRecord>, StoreError> {
        let (sql, key) = match lookup {
            Lookup::Id(id) => (format!("{SELECT_JACKPOT} WHERE j.id = ?1"), id),
            Lookup::Bet(bet_id) => (
                format!(
                    "{SELECT_JACKPOT}
                     JOIN jackpot_contribution jc ON jc.jackpot_id = j.id
                     WHERE jc.bet_id = ?1 AND jc.type = 'CONTRIBUTION'"
                ),
                bet_id,
            ),
        };
        let record = self
            .conn
            .query_row(&sql, params![key], |row| {
                Ok(JackpotRecord {
                    id: row.get(0)?,
                    initial_pool: decimal_at(row, 1)?,
                    created_at_ms: millis_at(row, 2)?,
                    contribution: ContributionRow {
                        kind: row.get(3)?,
                        percentage: opt_decimal_at(row, 4)?,
                        initial_percentage: opt_decimal_at(row, 5)?,
                        decay_rate: opt_decimal_at(row, 6)?,
                        min_percentage: opt_decimal_at(row, 7)?,
                    },
                    reward: RewardRow {
                        kind: row.get(8)?,
                        chance: opt_decimal_at(row, 9)?,
                        initial_chance: opt_decimal_at(row, 10)?,
                        max_pool_multiplier: opt_decimal_at(row, 11)?,
                    },
                })
            })
            .optional()?;
        Ok(record)
    }

    fn latest_pool(&mut self, jackpot_id: JackpotId) -> Result<Option<Decimal>, StoreError> {
        let pool = self
            .conn
            .query_row(
                "SELECT jackpot_amount_after FROM jackpot_contribution
                 WHERE jackpot_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![jackpot_id],
                |row| decimal_at(row, 0),
            )
            .optional()?;
        Ok(pool)
    }

    fn append(&mut self, entry: NewEntry) -> Result<LedgerEntry, StoreError> {
        // Never stamp a row earlier than the jackpot's newest one, even if the clock steps back.
        let newest: Option<i64> = self.conn.query_row(
            "SELECT MAX(created_at) FROM jackpot_contribution WHERE jackpot_id = ?1",
            params![entry.jackpot_id],
            |row| row.get(0),
        )?;
        let created_at = to_i64(now_ms()).max(newest.unwrap_or(0));

        let inserted = self.conn.execute(
            "INSERT INTO jackpot_contribution
                 (bet_id, user_id, jackpot_id, type, stake_amount, contribution_amount,
                  jackpot_amount_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.bet_id,
                entry.user_id,
                entry.jackpot_id,
                entry.kind.as_str(),
                entry.stake_amount.to_string(),
                entry.contribution_amount.to_string(),
                entry.pool_after.to_string(),
                created_at,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::Conflict {
                    bet_id: entry.bet_id,
                    kind: entry.kind,
                })
            }
            Err(err) => return Err(err.into()),
        }

        let id = self.conn.last_insert_rowid();
        debug!(
            id,
            bet_id = entry.bet_id,
            jackpot_id = entry.jackpot_id,
            kind = %entry.kind,
            pool_after = %entry.pool_after,
            "appended ledger entry"
        );
        Ok(entry.into_entry(id, u64::try_from(created_at).unwrap_or_default()))
    }

    fn find_contribution(
        &mut self,
        bet_id: BetId,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let entry = self
            .conn
            .query_row(
                &format!("{SELECT_ENTRY} WHERE bet_id = ?1 AND type = ?2"),
                params![bet_id, kind.as_str()],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn history(&mut self, jackpot_id: JackpotId) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ENTRY} WHERE jackpot_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![jackpot_id], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn create_jackpot(&mut self, jackpot: &NewJackpot) -> Result<Jackpot, StoreError> {
        jackpot
            .validate()
            .map_err(|source| StoreError::InvalidConfiguration {
                jackpot_id: jackpot.id.unwrap_or_default(),
                source,
            })?;
        if let Some(jackpot_id) = jackpot.id {
            let exists = self
                .conn
                .query_row(
                    "SELECT 1 FROM jackpot WHERE id = ?1",
                    params![jackpot_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(StoreError::JackpotExists { jackpot_id });
            }
        }

        let created_at = to_i64(now_ms());
        let contribution = ContributionRow::from(&jackpot.contribution);
        self.conn.execute(
            "INSERT INTO contribution_config
                 (type, percentage, variable_initial_percentage, variable_decay_rate,
                  min_percentage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contribution.kind,
                text(contribution.percentage),
                text(contribution.initial_percentage),
                text(contribution.decay_rate),
                text(contribution.min_percentage),
                created_at,
            ],
        )?;
        let contribution_config_id = self.conn.last_insert_rowid();

        let reward = RewardRow::from(&jackpot.reward);
        self.conn.execute(
            "INSERT INTO reward_config
                 (type, chance, initial_chance, max_pool_multiplier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reward.kind,
                text(reward.chance),
                text(reward.initial_chance),
                text(reward.max_pool_multiplier),
                created_at,
            ],
        )?;
        let reward_config_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "INSERT INTO jackpot
                 (id, initial_pool, contribution_config_id, reward_config_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                jackpot.id,
                jackpot.initial_pool.to_string(),
                contribution_config_id,
                reward_config_id,
                created_at,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(id, initial_pool = %jackpot.initial_pool, "created jackpot");

        JackpotRecord {
            id,
            initial_pool: jackpot.initial_pool,
            created_at_ms: u64::try_from(created_at).unwrap_or_default(),
            contribution,
            reward,
        }
        .into_jackpot(jackpot.initial_pool)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = row.get(4)?;
    let kind = EntryKind::from_str(&kind)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(err)))?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        bet_id: row.get(1)?,
        user_id: row.get(2)?,
        jackpot_id: row.get(3)?,
        kind,
        stake_amount: decimal_at(row, 5)?,
        contribution_amount: decimal_at(row, 6)?,
        pool_after: decimal_at(row, 7)?,
        created_at_ms: millis_at(row, 8)?,
    })
}

fn text(value: Option<Decimal>) -> Option<String> {
    value.map(|value| value.to_string())
}

fn parse_decimal(idx: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    parse_decimal(idx, &text)
}

fn opt_decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| parse_decimal(idx, &text))
        .transpose()
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err)))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
