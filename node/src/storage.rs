//! Wiring between validated configuration and the execution layer.

use jackpot_execution::{BetService, RandomSource, SeededDraw, UniformDraw};
use jackpot_ledger::{LedgerStore, LedgerTx, PostgresLedger, SqliteLedger, StoreError};
use jackpot_types::{Jackpot, NewJackpot};
use tracing::{info, warn};

use crate::{Storage, ValidatedConfig};

/// Ledger selected by configuration.
pub enum Ledger {
    Sqlite(SqliteLedger),
    Postgres(PostgresLedger),
}

impl Ledger {
    pub fn open(storage: &Storage) -> Result<Self, StoreError> {
        match storage {
            Storage::Sqlite { path, busy_timeout } => {
                info!(path = %path.display(), "opening sqlite ledger");
                Ok(Self::Sqlite(SqliteLedger::with_busy_timeout(
                    path,
                    *busy_timeout,
                )?))
            }
            Storage::Postgres {
                url,
                max_idle_connections,
            } => {
                info!("opening postgres ledger");
                Ok(Self::Postgres(PostgresLedger::with_max_idle(
                    url,
                    max_idle_connections.get(),
                )?))
            }
        }
    }
}

impl LedgerStore for Ledger {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        match self {
            Self::Sqlite(ledger) => ledger.transaction(f),
            Self::Postgres(ledger) => ledger.transaction(f),
        }
    }
}

pub type Service = BetService<Ledger, Box<dyn RandomSource>>;

pub fn random_source(seed: Option<u64>) -> Box<dyn RandomSource> {
    match seed {
        Some(seed) => {
            warn!(seed, "using deterministic draws");
            Box::new(SeededDraw::new(seed))
        }
        None => Box::new(UniformDraw),
    }
}

/// Create every configured jackpot that is not stored yet.
///
/// Existing jackpots are left untouched. Returns the jackpots that were created.
pub fn seed_jackpots<S: LedgerStore>(
    store: &S,
    jackpots: &[NewJackpot],
) -> Result<Vec<Jackpot>, StoreError> {
    let mut created = Vec::new();
    for jackpot in jackpots {
        let inserted = store.transaction(|tx| -> Result<Option<Jackpot>, StoreError> {
            if let Some(id) = jackpot.id {
                if let Some(existing) = tx.find_by_id(id)? {
                    if existing.initial_pool() != jackpot.initial_pool
                        || existing.contribution_strategy() != &jackpot.contribution
                        || existing.reward_strategy() != &jackpot.reward
                    {
                        warn!(jackpot_id = id, "stored jackpot differs from configuration");
                    }
                    return Ok(None);
                }
            }
            tx.create_jackpot(jackpot).map(Some)
        })?;
        if let Some(jackpot) = inserted {
            info!(
                jackpot_id = jackpot.id(),
                initial_pool = %jackpot.initial_pool(),
                contribution = jackpot.contribution_strategy().kind(),
                reward = jackpot.reward_strategy().kind(),
                "seeded jackpot"
            );
            created.push(jackpot);
        }
    }
    Ok(created)
}

/// Open the ledger, seed configured jackpots, and assemble the service.
pub fn build_service(config: &ValidatedConfig) -> Result<Service, StoreError> {
    let ledger = Ledger::open(&config.storage)?;
    seed_jackpots(&ledger, &config.jackpots)?;
    Ok(BetService::new(
        ledger,
        random_source(config.deterministic_seed),
    ))
}
