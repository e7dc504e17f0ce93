use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stakeguard::actor::PaperActor;
use stakeguard::amount::AmountError;
use stakeguard::app::{AdminError, App, BootError};
use stakeguard::config::{Config, ConfigError};
use stakeguard::csv::{CsvError, read_signals, write_records, write_status};
use stakeguard::ledger::{LedgerError, Resolution};
use stakeguard::{Amount, TxId};

#[derive(Debug, Parser)]
#[command(name = "stakeguard", version, about = "Transactional bet execution with a write-ahead ledger")]
struct Cli {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute the signals in a csv file against the paper actor, then print
    /// the ledger
    Run {
        signals: PathBuf,

        /// Enable the engine for this run
        #[arg(long)]
        enable: bool,
    },
    /// Print balances and breaker state
    Status,
    /// Print every ledger row
    Ledger,
    /// Clear the breaker, including a structural lock
    ResetBreaker,
    /// Resolve a MANUAL_CHECK row
    #[command(group(ArgGroup::new("verdict").required(true).args(["placed", "not_placed"])))]
    Resolve {
        tx_id: String,

        /// The external records show the action ran
        #[arg(long)]
        placed: bool,

        /// Nothing happened externally: refund
        #[arg(long)]
        not_placed: bool,
    },
    /// Settle a PLACED row; a payout of 0 is a loss
    Settle { tx_id: String, payout: f64 },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Csv(#[from] CsvError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("invalid payout: {0}")]
    Payout(#[from] AmountError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let actor = Arc::new(PaperActor::new(config.initial_balance()?));
    let app = App::boot(config, actor)?;
    let result = command(&app, cli.command).await;
    app.shutdown().await;
    result
}

async fn command(app: &App, command: Command) -> Result<(), CliError> {
    match command {
        Command::Run { signals, enable } => {
            if !signals.extension().is_some_and(|ext| ext == "csv") {
                warn!(path = %signals.display(), "input file seems to not be a csv file");
            }
            if enable {
                app.enable();
            }

            let rows = read_signals(signals.clone())?;
            let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                for result in rows {
                    match result {
                        Ok(signal) => {
                            if signal_tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("{e}"),
                    }
                }
            });

            tokio::select! {
                accepted = app.run(ReceiverStream::new(signal_rx)) => {
                    info!(accepted, "signals submitted");
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, finishing queued signals");
                }
            }
            app.shutdown().await;
            write_records(&app.ledger().records()?, io::stdout().lock())?;
        }
        Command::Status => {
            let status = app.status()?;
            write_status(
                &status.balance,
                &status.breaker,
                status.pending.len(),
                status.unsettled.len(),
                io::stdout().lock(),
            )?;
        }
        Command::Ledger => {
            write_records(&app.ledger().records()?, io::stdout().lock())?;
        }
        Command::ResetBreaker => {
            app.reset_breaker();
        }
        Command::Resolve {
            tx_id,
            placed,
            not_placed: _,
        } => {
            let resolution = if placed {
                Resolution::Placed
            } else {
                Resolution::NotPlaced
            };
            let status = app.resolve(&TxId::from(tx_id.as_str()), resolution)?;
            println!("{tx_id},{status}");
        }
        Command::Settle { tx_id, payout } => {
            let payout = Amount::try_from_f64(payout)?;
            let balance = app.settle(&TxId::from(tx_id.as_str()), payout)?;
            println!("{tx_id},{balance}");
        }
    }
    Ok(())
}
