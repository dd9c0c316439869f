use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jackpot_execution::PlaceBetOutcome;
use jackpot_ledger::LedgerStore;
use jackpot_node::{
    consumer::{BetMailbox, Consumer},
    storage::{build_service, seed_jackpots, Ledger, Service},
    Config, ValidatedConfig,
};
use jackpot_types::{audit, BetId, Decimal, JackpotId, PlacedBet, UserId};
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Progressive jackpot ledger.")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Validate the configuration, print it with secrets redacted, and exit.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Create configured jackpots that are not stored yet.
    Seed,
    /// Record a bet's contribution to its jackpot.
    PlaceBet {
        #[arg(long)]
        bet_id: BetId,
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        jackpot_id: JackpotId,
        #[arg(long)]
        amount: Decimal,
    },
    /// Draw for a contributed bet and print the settlement.
    Settle {
        #[arg(long)]
        bet_id: BetId,
    },
    /// Print a jackpot's current pool and win chance.
    Pool {
        #[arg(long)]
        jackpot_id: JackpotId,
    },
    /// Replay a jackpot's history and check it against the current pool.
    Audit {
        #[arg(long)]
        jackpot_id: JackpotId,
    },
    /// Read newline-delimited JSON bets from stdin.
    Consume,
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    let args = Args::parse();

    let contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Could not read config file {}", args.config.display()))?;
    let config: Config = serde_yaml::from_str(&contents).context("Could not parse config file")?;

    if args.dry_run {
        println!("{:#?}", config.redacted_debug());
        config.validate().context("Invalid config")?;
        return Ok(());
    }
    let config = config.validate().context("Invalid config")?;
    init_tracing(&config);

    let Some(command) = args.command else {
        anyhow::bail!("a command is required unless --dry-run is set");
    };
    run(command, &config)
}

fn init_tracing(config: &ValidatedConfig) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(command: Command, config: &ValidatedConfig) -> Result<()> {
    let service = || build_service(config).context("Failed to open ledger");
    match command {
        Command::Seed => {
            let ledger = Ledger::open(&config.storage).context("Failed to open ledger")?;
            let created = seed_jackpots(&ledger, &config.jackpots).context("Failed to seed")?;
            print_json(&json!({
                "created": created.iter().map(|jackpot| jackpot.id()).collect::<Vec<_>>(),
            }))
        }
        Command::PlaceBet {
            bet_id,
            user_id,
            jackpot_id,
            amount,
        } => {
            let bet = PlacedBet {
                bet_id,
                user_id,
                jackpot_id,
                amount,
            };
            let output = match service()?.place_bet(&bet).context("Failed to place bet")? {
                PlaceBetOutcome::Contributed(entry) => json!({
                    "status": "contributed",
                    "entry": entry,
                }),
                PlaceBetOutcome::AlreadyProcessed => json!({
                    "status": "already_processed",
                    "bet_id": bet_id,
                }),
            };
            print_json(&output)
        }
        Command::Settle { bet_id } => {
            let settlement = service()?.settle_reward(bet_id).context("Failed to settle bet")?;
            print_json(&settlement)
        }
        Command::Pool { jackpot_id } => {
            let jackpot = service()?
                .store()
                .transaction(|tx| tx.find_by_id(jackpot_id))
                .context("Failed to load jackpot")?
                .with_context(|| format!("No jackpot with id {jackpot_id}"))?;
            print_json(&json!({
                "jackpot_id": jackpot.id(),
                "initial_pool": jackpot.initial_pool(),
                "current_pool": jackpot.current_pool(),
                "reward_chance": jackpot.calculate_reward_chance(),
                "contribution": jackpot.contribution_strategy(),
                "reward": jackpot.reward_strategy(),
            }))
        }
        Command::Audit { jackpot_id } => audit_jackpot(&service()?, jackpot_id),
        Command::Consume => consume(service()?, config),
    }
}

fn audit_jackpot(service: &Service, jackpot_id: JackpotId) -> Result<()> {
    let (jackpot, history) = service
        .store()
        .transaction(|tx| -> Result<_, jackpot_ledger::StoreError> {
            Ok((tx.find_by_id(jackpot_id)?, tx.history(jackpot_id)?))
        })
        .context("Failed to load history")?;
    let jackpot = jackpot.with_context(|| format!("No jackpot with id {jackpot_id}"))?;
    let replayed = audit::replay(jackpot_id, jackpot.initial_pool(), &history)
        .context("History is inconsistent")?;
    if replayed != jackpot.current_pool() {
        anyhow::bail!(
            "replayed pool {replayed} does not match current pool {}",
            jackpot.current_pool()
        );
    }
    print_json(&json!({
        "jackpot_id": jackpot_id,
        "entries": history.len(),
        "current_pool": replayed,
    }))
}

fn consume(service: Service, config: &ValidatedConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    let stats = runtime.block_on(async {
        let (mailbox, receiver) = BetMailbox::new(config.buffer_size.get());
        let consumer = tokio::spawn(
            Consumer::new(Arc::new(service), config.workers.get()).run(receiver),
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_number = 0u64;
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PlacedBet>(&line) {
                Ok(bet) => {
                    if !mailbox.deliver(bet).await {
                        break;
                    }
                }
                Err(err) => warn!(line = line_number, %err, "skipping malformed bet"),
            }
        }
        drop(mailbox);
        consumer.await.context("Bet consumer failed")
    })?;
    info!(
        contributed = stats.contributed,
        duplicates = stats.duplicates,
        failed = stats.failed,
        "finished consuming bets"
    );
    print_json(&json!({
        "contributed": stats.contributed,
        "duplicates": stats.duplicates,
        "failed": stats.failed,
    }))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_place_bet() {
        let args = Args::parse_from([
            "jackpot-node",
            "--config",
            "node.yaml",
            "place-bet",
            "--bet-id",
            "123",
            "--user-id",
            "456",
            "--jackpot-id",
            "1",
            "--amount",
            "100.00",
        ]);
        assert_eq!(args.config, PathBuf::from("node.yaml"));
        assert!(!args.dry_run);
        assert_eq!(
            args.command,
            Some(Command::PlaceBet {
                bet_id: 123,
                user_id: 456,
                jackpot_id: 1,
                amount: dec!(100.00),
            })
        );
    }

    #[test]
    fn parses_dry_run_without_command() {
        let args = Args::parse_from(["jackpot-node", "--config", "node.yaml", "--dry-run"]);
        assert!(args.dry_run);
        assert!(args.command.is_none());
    }

    #[test]
    fn rejects_bad_amount() {
        let result = Args::try_parse_from([
            "jackpot-node",
            "--config",
            "node.yaml",
            "place-bet",
            "--bet-id",
            "1",
            "--user-id",
            "1",
            "--jackpot-id",
            "1",
            "--amount",
            "lots",
        ]);
        assert!(result.is_err());
    }
}
