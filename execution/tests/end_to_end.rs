use std::{collections::HashMap, sync::Arc, thread};

use jackpot_execution::{BetService, PlaceBetOutcome, RandomSource, SeededDraw};
use jackpot_ledger::{LedgerStore, SqliteLedger, StoreError};
use jackpot_types::{
    audit, ContributionStrategy, Decimal, EntryKind, NewJackpot, PlacedBet, RewardStrategy,
    Settlement,
};
use rust_decimal_macros::dec;
use tempfile::TempDir;

struct Always(Decimal);

impl RandomSource for Always {
    fn draw(&self) -> Decimal {
        self.0
    }
}

fn ledger(jackpot: NewJackpot) -> (TempDir, SqliteLedger) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = SqliteLedger::open(&dir.path().join("ledger.db")).expect("open ledger");
    ledger
        .transaction(|tx| tx.create_jackpot(&jackpot))
        .expect("seed jackpot");
    (dir, ledger)
}

fn fixed(percentage: Decimal, chance: Decimal) -> NewJackpot {
    NewJackpot {
        id: Some(1),
        initial_pool: dec!(1000.00),
        contribution: ContributionStrategy::fixed(percentage).expect("valid"),
        reward: RewardStrategy::fixed(chance).expect("valid"),
    }
}

fn bet(bet_id: i64, amount: Decimal) -> PlacedBet {
    PlacedBet {
        bet_id,
        user_id: 456,
        jackpot_id: 1,
        amount,
    }
}

fn current_pool<S: LedgerStore>(store: &S) -> Decimal {
    store
        .transaction(|tx| tx.find_by_id(1))
        .expect("load")
        .expect("jackpot")
        .current_pool()
}

fn contributed(outcome: PlaceBetOutcome) -> Decimal {
    match outcome {
        PlaceBetOutcome::Contributed(entry) => entry.contribution_amount,
        PlaceBetOutcome::AlreadyProcessed => panic!("bet was not new"),
    }
}

#[test]
fn fixed_contribution_grows_pool() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.01)));
    let service = BetService::new(store, Always(dec!(0.5)));
    let amount = contributed(service.place_bet(&bet(123, dec!(100.00))).expect("placed"));
    assert_eq!(amount, dec!(10.0000));
    assert_eq!(amount.to_string(), "10.0000");
    assert_eq!(current_pool(service.store()), dec!(1010.00));
}

#[test]
fn variable_contribution_decays_with_pool() {
    let (_dir, store) = ledger(NewJackpot {
        id: Some(1),
        initial_pool: dec!(1000.00),
        contribution: ContributionStrategy::variable(dec!(0.10), dec!(0.02), dec!(0.05))
            .expect("valid"),
        reward: RewardStrategy::variable(dec!(0.01), dec!(5)).expect("valid"),
    });
    let service = BetService::new(store, Always(dec!(0.999)));

    // 25 000 at the initial pool contributes 10%, taking the pool to 3.5x.
    let first = contributed(service.place_bet(&bet(1, dec!(25000.00))).expect("placed"));
    assert_eq!(first, dec!(2500.00));
    assert_eq!(current_pool(service.store()), dec!(3500.00));

    let second = contributed(service.place_bet(&bet(2, dec!(100.00))).expect("placed"));
    assert_eq!(second, dec!(5.0000));
}

#[test]
fn winning_settlement_resets_pool() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.01)));
    let service = BetService::new(store, Always(dec!(0.005)));
    service.place_bet(&bet(1, dec!(100.00))).expect("placed");

    let settlement = service.settle_reward(1).expect("settled");
    assert_eq!(settlement, Settlement::won(1, dec!(1010.00)));
    assert_eq!(current_pool(service.store()), dec!(1000.00));
    assert_eq!(service.settle_reward(1).expect("replayed"), settlement);
}

#[test]
fn duplicate_deliveries_write_once() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.01)));
    let service = BetService::new(store, Always(dec!(0.5)));
    service.place_bet(&bet(1, dec!(100.00))).expect("placed");
    assert_eq!(
        service.place_bet(&bet(1, dec!(100.00))).expect("duplicate"),
        PlaceBetOutcome::AlreadyProcessed
    );
    assert_eq!(service.settle_reward(1).expect("settled"), Settlement::lost(1));
    assert_eq!(service.settle_reward(1).expect("replayed"), Settlement::lost(1));

    let history = service
        .store()
        .transaction(|tx| tx.history(1))
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, EntryKind::Contribution);
    assert_eq!(history[1].kind, EntryKind::Unrewarded);
}

#[test]
fn settling_unknown_bet_is_not_found() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.01)));
    let service = BetService::new(store, Always(dec!(0.5)));
    assert!(matches!(
        service.settle_reward(404),
        Err(jackpot_execution::SettlementError::NotFound(_))
    ));
}

#[test]
fn concurrent_deliveries_keep_ledger_consistent() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.05)));
    let service = Arc::new(BetService::new(store, SeededDraw::new(7)));

    // Every bet is delivered by two workers, and both try to settle it.
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let mut outcomes = Vec::new();
                for n in 0..20 {
                    let bet_id = (worker % 2) * 100 + n;
                    service.place_bet(&bet(bet_id, dec!(10.00))).expect("place");
                    outcomes.push(service.settle_reward(bet_id).expect("settle"));
                }
                outcomes
            })
        })
        .collect();

    let mut seen: HashMap<i64, Settlement> = HashMap::new();
    for handle in handles {
        for settlement in handle.join().expect("worker") {
            if let Some(previous) = seen.insert(settlement.bet_id, settlement.clone()) {
                assert_eq!(previous, settlement, "bet {}", settlement.bet_id);
            }
        }
    }
    assert_eq!(seen.len(), 40);

    let history = service
        .store()
        .transaction(|tx| tx.history(1))
        .expect("history");
    assert_eq!(history.len(), 80);
    let replayed = audit::replay(1, dec!(1000.00), &history).expect("consistent history");
    assert_eq!(replayed, current_pool(service.store()));
}

#[test]
fn rejected_bet_writes_nothing() {
    let (_dir, store) = ledger(fixed(dec!(0.10), dec!(0.01)));
    let service = BetService::new(store, Always(dec!(0.5)));
    assert!(service.place_bet(&bet(1, Decimal::ZERO)).is_err());
    let history: Result<_, StoreError> = service.store().transaction(|tx| tx.history(1));
    assert!(history.expect("history").is_empty());
}
