use std::{net::IpAddr, str::FromStr, sync::Mutex};

use jackpot_types::{BetId, EntryKind, Jackpot, JackpotId, LedgerEntry, NewJackpot};
use postgres::{error::SqlState, Client, NoTls, Row, Transaction};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use url::Url;

use crate::{
    now_ms, ContributionRow, JackpotRecord, LedgerStore, LedgerTx, Lookup, NewEntry, RewardRow,
    StoreError,
};

const DEFAULT_MAX_IDLE: usize = 8;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS contribution_config (
         id BIGSERIAL PRIMARY KEY,
         type TEXT NOT NULL CHECK (type IN ('FIXED', 'VARIABLE')),
         percentage NUMERIC,
         variable_initial_percentage NUMERIC,
         variable_decay_rate NUMERIC,
         min_percentage NUMERIC,
         created_at BIGINT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS reward_config (
         id BIGSERIAL PRIMARY KEY,
         type TEXT NOT NULL CHECK (type IN ('FIXED', 'VARIABLE')),
         chance NUMERIC,
         initial_chance NUMERIC,
         max_pool_multiplier NUMERIC,
         created_at BIGINT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS jackpot (
         id BIGSERIAL PRIMARY KEY,
         initial_pool NUMERIC NOT NULL,
         contribution_config_id BIGINT NOT NULL REFERENCES contribution_config (id),
         reward_config_id BIGINT NOT NULL REFERENCES reward_config (id),
         created_at BIGINT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS jackpot_contribution (
         id BIGSERIAL PRIMARY KEY,
         bet_id BIGINT NOT NULL,
         user_id BIGINT NOT NULL,
         jackpot_id BIGINT NOT NULL REFERENCES jackpot (id),
         type TEXT NOT NULL CHECK (type IN ('CONTRIBUTION', 'REWARD', 'UNREWARDED')),
         stake_amount NUMERIC NOT NULL,
         contribution_amount NUMERIC NOT NULL,
         jackpot_amount_after NUMERIC NOT NULL,
         created_at BIGINT NOT NULL,
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

/// Ledger stored in Postgres.
///
/// Loading a jackpot takes a row lock on it (`FOR UPDATE`), which serializes every write
/// against the same jackpot for the rest of the transaction.
pub struct PostgresLedger {
    url: String,
    idle: Mutex<Vec<Client>>,
    max_idle: usize,
}

impl PostgresLedger {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        Self::with_max_idle(url, DEFAULT_MAX_IDLE)
    }

    /// Connect, keeping at most `max_idle` clients around between transactions.
    pub fn with_max_idle(url: &str, max_idle: usize) -> Result<Self, StoreError> {
        validate_postgres_url(url)?;
        let ledger = Self {
            url: url.to_string(),
            idle: Mutex::new(Vec::new()),
            max_idle: max_idle.max(1),
        };
        let mut client = ledger.checkout()?;
        client.batch_execute(SCHEMA)?;
        ledger.checkin(client);
        Ok(ledger)
    }

    fn checkout(&self) -> Result<Client, StoreError> {
        let idle = self.idle.lock().map_err(|_| StoreError::Poisoned)?.pop();
        match idle {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Ok(Client::connect(&self.url, NoTls)?),
        }
    }

    fn checkin(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) if idle.len() < self.max_idle => idle.push(client),
            Ok(_) => {}
            Err(_) => warn!("postgres client pool poisoned; dropping client"),
        }
    }
}

impl LedgerStore for PostgresLedger {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut client = self.checkout()?;
        let result = run(&mut client, f);
        self.checkin(client);
        result
    }
}

fn run<T, E, F>(client: &mut Client, f: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
    E: From<StoreError>,
{
    let tx = client.transaction().map_err(StoreError::from)?;
    let mut pg = PgTx { tx };
    let value = f(&mut pg)?;
    pg.tx.commit().map_err(StoreError::from)?;
    Ok(value)
}

struct PgTx<'a> {
    tx: Transaction<'a>,
}

impl LedgerTx for PgTx<'_> {
    fn jackpot_record(&mut self, lookup: Lookup) -> Result<Option<JackpotRecord>, StoreError> {
        let (sql, key) = match lookup {
            Lookup::Id(id) => (format!("{SELECT_JACKPOT} WHERE j.id = $1 FOR UPDATE OF j"), id),
            Lookup::Bet(bet_id) => (
                format!(
                    "{SELECT_JACKPOT}
                     JOIN jackpot_contribution jc ON jc.jackpot_id = j.id
                     WHERE jc.bet_id = $1 AND jc.type = 'CONTRIBUTION'
                     FOR UPDATE OF j"
                ),
                bet_id,
            ),
        };
        let Some(row) = self.tx.query_opt(sql.as_str(), &[&key])? else {
            return Ok(None);
        };
        Ok(Some(JackpotRecord {
            id: row.try_get(0)?,
            initial_pool: row.try_get(1)?,
            created_at_ms: to_u64(row.try_get(2)?, "jackpot.created_at")?,
            contribution: ContributionRow {
                kind: row.try_get(3)?,
                percentage: row.try_get(4)?,
                initial_percentage: row.try_get(5)?,
                decay_rate: row.try_get(6)?,
                min_percentage: row.try_get(7)?,
            },
            reward: RewardRow {
                kind: row.try_get(8)?,
                chance: row.try_get(9)?,
                initial_chance: row.try_get(10)?,
                max_pool_multiplier: row.try_get(11)?,
            },
        }))
    }

    fn latest_pool(&mut self, jackpot_id: JackpotId) -> Result<Option<Decimal>, StoreError> {
        let row = self.tx.query_opt(
            "SELECT jackpot_amount_after FROM jackpot_contribution
             WHERE jackpot_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            &[&jackpot_id],
        )?;
        Ok(row.map(|row| row.try_get(0)).transpose()?)
    }

    fn append(&mut self, entry: NewEntry) -> Result<LedgerEntry, StoreError> {
        let now = to_i64(now_ms());
        let kind = entry.kind.as_str();
        let inserted = self.tx.query_one(
            "INSERT INTO jackpot_contribution
                 (bet_id, user_id, jackpot_id, type, stake_amount, contribution_amount,
                  jackpot_amount_after, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, GREATEST($8, COALESCE(
                 (SELECT MAX(created_at) FROM jackpot_contribution WHERE jackpot_id = $3), 0)))
             RETURNING id, created_at",
            &[
                &entry.bet_id,
                &entry.user_id,
                &entry.jackpot_id,
                &kind,
                &entry.stake_amount,
                &entry.contribution_amount,
                &entry.pool_after,
                &now,
            ],
        );
        let row = match inserted {
            Ok(row) => row,
            Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                return Err(StoreError::Conflict {
                    bet_id: entry.bet_id,
                    kind: entry.kind,
                })
            }
            Err(err) => return Err(err.into()),
        };

        let id: i64 = row.try_get(0)?;
        let created_at = to_u64(row.try_get(1)?, "jackpot_contribution.created_at")?;
        debug!(
            id,
            bet_id = entry.bet_id,
            jackpot_id = entry.jackpot_id,
            kind = %entry.kind,
            pool_after = %entry.pool_after,
            "appended ledger entry"
        );
        Ok(entry.into_entry(id, created_at))
    }

    fn find_contribution(
        &mut self,
        bet_id: BetId,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let kind = kind.as_str();
        let row = self.tx.query_opt(
            format!("{SELECT_ENTRY} WHERE bet_id = $1 AND type = $2").as_str(),
            &[&bet_id, &kind],
        )?;
        row.as_ref().map(entry_from_row).transpose()
    }

    fn history(&mut self, jackpot_id: JackpotId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.tx
            .query(
                format!("{SELECT_ENTRY} WHERE jackpot_id = $1 ORDER BY created_at ASC, id ASC")
                    .as_str(),
                &[&jackpot_id],
            )?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    fn create_jackpot(&mut self, jackpot: &NewJackpot) -> Result<Jackpot, StoreError> {
        jackpot
            .validate()
            .map_err(|source| StoreError::InvalidConfiguration {
                jackpot_id: jackpot.id.unwrap_or_default(),
                source,
            })?;
        if let Some(jackpot_id) = jackpot.id {
            if self
                .tx
                .query_opt("SELECT 1 FROM jackpot WHERE id = $1", &[&jackpot_id])?
                .is_some()
            {
                return Err(StoreError::JackpotExists { jackpot_id });
            }
        }

        let created_at = to_i64(now_ms());
        let contribution = ContributionRow::from(&jackpot.contribution);
        let contribution_config_id: i64 = self
            .tx
            .query_one(
                "INSERT INTO contribution_config
                     (type, percentage, variable_initial_percentage, variable_decay_rate,
                      min_percentage, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING id",
                &[
                    &contribution.kind,
                    &contribution.percentage,
                    &contribution.initial_percentage,
                    &contribution.decay_rate,
                    &contribution.min_percentage,
                    &created_at,
                ],
            )?
            .try_get(0)?;

        let reward = RewardRow::from(&jackpot.reward);
        let reward_config_id: i64 = self
            .tx
            .query_one(
                "INSERT INTO reward_config
                     (type, chance, initial_chance, max_pool_multiplier, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
                &[
                    &reward.kind,
                    &reward.chance,
                    &reward.initial_chance,
                    &reward.max_pool_multiplier,
                    &created_at,
                ],
            )?
            .try_get(0)?;

        let id: i64 = self
            .tx
            .query_one(
                "INSERT INTO jackpot
                     (id, initial_pool, contribution_config_id, reward_config_id, created_at)
                 VALUES (COALESCE($1, nextval(pg_get_serial_sequence('jackpot', 'id'))),
                         $2, $3, $4, $5)
                 RETURNING id",
                &[
                    &jackpot.id,
                    &jackpot.initial_pool,
                    &contribution_config_id,
                    &reward_config_id,
                    &created_at,
                ],
            )?
            .try_get(0)?;
        if jackpot.id.is_some() {
            // Keep generated ids clear of explicitly seeded ones.
            self.tx.execute(
                "SELECT setval(pg_get_serial_sequence('jackpot', 'id'),
                               GREATEST((SELECT MAX(id) FROM jackpot), 1))",
                &[],
            )?;
        }
        debug!(id, initial_pool = %jackpot.initial_pool, "created jackpot");

        JackpotRecord {
            id,
            initial_pool: jackpot.initial_pool,
            created_at_ms: to_u64(created_at, "jackpot.created_at")?,
            contribution,
            reward,
        }
        .into_jackpot(jackpot.initial_pool)
    }
}

fn entry_from_row(row: &Row) -> Result<LedgerEntry, StoreError> {
    let kind: String = row.try_get(4)?;
    let kind = EntryKind::from_str(&kind).map_err(|_| StoreError::Corrupt {
        column: "jackpot_contribution.type",
        value: kind.clone(),
    })?;
    Ok(LedgerEntry {
        id: row.try_get(0)?,
        bet_id: row.try_get(1)?,
        user_id: row.try_get(2)?,
        jackpot_id: row.try_get(3)?,
        kind,
        stake_amount: row.try_get(5)?,
        contribution_amount: row.try_get(6)?,
        pool_after: row.try_get(7)?,
        created_at_ms: to_u64(row.try_get(8)?, "jackpot_contribution.created_at")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64, column: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}

/// Reject URLs that point at a public host.
///
/// Loopback and private addresses are always accepted. Set `JACKPOT_LEDGER_ALLOW_HOSTNAME=1` to
/// accept DNS names, or `JACKPOT_LEDGER_ALLOW_PUBLIC=1` to skip the check entirely.
pub fn validate_postgres_url(url: &str) -> Result<(), StoreError> {
    if env_flag("JACKPOT_LEDGER_ALLOW_PUBLIC") {
        return Ok(());
    }

    let parsed = Url::parse(url).map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        return Err(StoreError::InvalidUrl(
            "postgres url must start with postgres:// or postgresql://".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::InvalidUrl("postgres url missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        return Err(StoreError::InvalidUrl(
            "postgres host is public; set JACKPOT_LEDGER_ALLOW_PUBLIC=1 to override".to_string(),
        ));
    }

    if env_flag("JACKPOT_LEDGER_ALLOW_HOSTNAME") {
        return Ok(());
    }

    Err(StoreError::InvalidUrl(
        "postgres host must be a private IP; set JACKPOT_LEDGER_ALLOW_HOSTNAME=1 to allow hostnames"
            .to_string(),
    ))
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}
