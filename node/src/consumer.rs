//! Bounded mailbox that feeds placed bets into the ledger.
//!
//! Bets are acknowledged once `place_bet` returns, whatever the result. Failed bets are logged
//! and counted; nothing is retried.

use std::sync::Arc;

use jackpot_execution::{BetService, PlaceBetOutcome, RandomSource};
use jackpot_ledger::LedgerStore;
use jackpot_types::PlacedBet;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, warn};

/// Sending half of the consumer queue.
#[derive(Clone)]
pub struct BetMailbox {
    sender: mpsc::Sender<PlacedBet>,
}

impl BetMailbox {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<PlacedBet>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a bet, waiting for space. Returns false once the consumer has stopped.
    pub async fn deliver(&self, bet: PlacedBet) -> bool {
        let bet_id = bet.bet_id;
        if self.sender.send(bet).await.is_err() {
            warn!(bet_id, "bet consumer stopped; dropping bet");
            return false;
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub contributed: u64,
    pub duplicates: u64,
    pub failed: u64,
}

enum Handled {
    Contributed,
    Duplicate,
    Failed,
}

impl ConsumerStats {
    fn record(&mut self, handled: Handled) {
        match handled {
            Handled::Contributed => self.contributed += 1,
            Handled::Duplicate => self.duplicates += 1,
            Handled::Failed => self.failed += 1,
        }
    }
}

/// Drains a [`BetMailbox`] with at most `workers` bets in flight.
pub struct Consumer<S, R> {
    service: Arc<BetService<S, R>>,
    workers: usize,
}

impl<S, R> Consumer<S, R>
where
    S: LedgerStore + 'static,
    R: RandomSource + 'static,
{
    pub fn new(service: Arc<BetService<S, R>>, workers: usize) -> Self {
        Self {
            service,
            workers: workers.max(1),
        }
    }

    /// Run until every sender is dropped and the queue is empty.
    pub async fn run(self, mut receiver: mpsc::Receiver<PlacedBet>) -> ConsumerStats {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut stats = ConsumerStats::default();

        while let Some(bet) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!(?err, "bet consumer semaphore closed");
                    break;
                }
            };
            let service = Arc::clone(&self.service);
            tasks.spawn_blocking(move || {
                let handled = handle(&service, &bet);
                drop(permit);
                handled
            });
            while let Some(joined) = tasks.try_join_next() {
                record_join(&mut stats, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record_join(&mut stats, joined);
        }
        debug!(?stats, "bet consumer drained");
        stats
    }
}

fn handle<S: LedgerStore, R: RandomSource>(service: &BetService<S, R>, bet: &PlacedBet) -> Handled {
    match service.place_bet(bet) {
        Ok(PlaceBetOutcome::Contributed(_)) => Handled::Contributed,
        Ok(PlaceBetOutcome::AlreadyProcessed) => Handled::Duplicate,
        Err(err) => {
            error!(
                bet_id = bet.bet_id,
                jackpot_id = bet.jackpot_id,
                error = %err,
                "failed to place bet"
            );
            Handled::Failed
        }
    }
}

fn record_join(stats: &mut ConsumerStats, joined: Result<Handled, tokio::task::JoinError>) {
    match joined {
        Ok(handled) => stats.record(handled),
        Err(err) => {
            error!(?err, "bet worker panicked");
            stats.record(Handled::Failed);
        }
    }
}
