//! Process wiring: boot sequence, background tasks, admin surface and
//! shutdown.
//!
//! Boot order matters. Recovery runs against the ledger before the bus,
//! worker or coordinator exist, so no new signal can be admitted until every
//! row left behind by the previous process has been resolved.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::actor::Actor;
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::bus::{BusStats, Event, EventBus, EventKind};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::coordinator::{Coordinator, run_watchdog};
use crate::guard::InvariantGuard;
use crate::ledger::recovery::{RecoveryLog, RecoveryLogError};
use crate::ledger::{AuditReport, LedgerError, LedgerStore, RecoveryReport, Resolution};
use crate::money::{MoneyManager, MoneyStats, ReconcileOutcome, StakeError};
use crate::model::{BalanceSnapshot, Signal, TxId, TxRecord, TxStatus};
use crate::worker::{Worker, WorkerOptions, WorkerStats};

#[derive(Debug, Error)]
pub enum BootError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("recovery log: {0}")]
    RecoveryLog(#[from] RecoveryLogError),

    #[error("data directory {path} is in use by another process")]
    DataDirInUse { path: PathBuf },

    #[error("cannot lock data directory {path}: {source}")]
    Lock {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

/// Exclusive ownership of the data directory for as long as the app lives.
///
/// An open `BEGIN EXCLUSIVE` on a dedicated sqlite file. The OS drops the
/// lock with the process, so a crash never leaves a stale lock behind.
struct DataDirLock {
    _conn: Connection,
}

impl DataDirLock {
    fn acquire(path: PathBuf) -> Result<Self, BootError> {
        let lock_error = |source: rusqlite::Error| match source.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                BootError::DataDirInUse { path: path.clone() }
            }
            _ => BootError::Lock {
                path: path.clone(),
                source,
            },
        };

        let conn = Connection::open(&path).map_err(lock_error)?;
        conn.busy_timeout(Duration::ZERO).map_err(lock_error)?;
        conn.execute_batch("PRAGMA locking_mode = EXCLUSIVE; BEGIN EXCLUSIVE;")
            .map_err(lock_error)?;
        debug!(path = %path.display(), "data directory locked");
        Ok(Self { _conn: conn })
    }
}

/// Errors from the admin surface.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown transaction {0}")]
    UnknownTx(TxId),

    #[error("transaction {tx_id} is {status}, expected {expected}")]
    WrongStatus {
        tx_id: TxId,
        status: TxStatus,
        expected: TxStatus,
    },

    #[error("payout {0} must not be negative")]
    NegativePayout(Amount),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Stake(#[from] StakeError),
}

/// Snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub enabled: bool,
    pub balance: BalanceSnapshot,
    pub pending: Vec<TxRecord>,
    pub unsettled: Vec<TxRecord>,
    pub breaker: BreakerStatus,
    pub money: MoneyStats,
    pub worker: WorkerStats,
    pub bus: BusStats,
}

pub struct App {
    config: Config,
    actor: Arc<dyn Actor>,
    money: Arc<MoneyManager>,
    bus: EventBus,
    worker: Arc<Worker>,
    coordinator: Arc<Coordinator>,
    recovery: RecoveryReport,
    audit: AuditReport,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _lock: DataDirLock,
}

/// Public API
impl App {
    /// Boot with the system clock. Must be called from within a tokio
    /// runtime.
    pub fn boot(config: Config, actor: Arc<dyn Actor>) -> Result<Self, BootError> {
        Self::boot_with_clock(config, actor, Arc::new(SystemClock))
    }

    /// Boot sequence:
    ///
    /// - Validate the configuration and create the data directory
    /// - Take the data directory lock; a second process fails here, before
    ///   it can touch the ledger
    /// - Open the ledger and the recovery log
    /// - Resolve every non-terminal row using the recovery markers, then
    ///   archive the markers
    /// - Audit the balance against its delta journal
    /// - Restore the breaker, start the bus and the worker
    /// - Build the coordinator and start the background tasks
    pub fn boot_with_clock(
        config: Config,
        actor: Arc<dyn Actor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BootError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(|source| BootError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;
        let lock = DataDirLock::acquire(config.lock_path())?;

        let ledger = Arc::new(LedgerStore::open_with_clock(
            config.ledger_path(),
            config.initial_balance()?,
            InvariantGuard::new(config.guard_mode),
            clock.clone(),
        )?);

        let recovery_log = Arc::new(RecoveryLog::open(config.recovery_log_path())?);
        let markers = recovery_log.marked_tx_ids()?;
        let recovery = ledger.recover_on_boot(&markers)?;
        if let Some(archived) = recovery_log.archive(clock.now_ms())? {
            info!(path = %archived.display(), markers = markers.len(), "recovery markers archived");
        }
        let audit = ledger.audit()?;
        info!(balance = %audit.balance.current, rows = audit.rows, "ledger audit passed");

        let breaker = Arc::new(CircuitBreaker::with_state_file(
            config.breaker.clone(),
            config.breaker_state_path(),
            clock.clone(),
        ));
        let bus = EventBus::start(&config.bus);
        let money = Arc::new(MoneyManager::new(ledger.clone(), &config.money)?);
        let worker = Arc::new(Worker::start(WorkerOptions::from(&config.worker)));
        let coordinator = Arc::new(Coordinator::new(
            actor.clone(),
            money.clone(),
            breaker,
            bus.clone(),
            recovery_log,
            clock,
            &config.coordinator,
        ));

        bus.publish(Event::system(
            EventKind::RecoveryCompleted,
            format!(
                "refunded {}, demoted {}, promoted {}, orphan markers {}",
                recovery.refunded.len(),
                recovery.demoted.len(),
                recovery.promoted.len(),
                recovery.orphan_markers.len()
            ),
        ));

        let (shutdown, _) = watch::channel(false);
        let app = Self {
            config,
            actor,
            money,
            bus,
            worker,
            coordinator,
            recovery,
            audit,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            _lock: lock,
        };
        app.spawn_background_tasks();
        info!(enabled = app.coordinator.is_enabled(), "stakeguard booted");
        Ok(app)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        self.money.ledger()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// What boot recovery did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn audit_report(&self) -> &AuditReport {
        &self.audit
    }

    /// Queue a signal for execution. Returns whether it was accepted.
    pub fn submit_signal(&self, signal: Signal) -> bool {
        let coordinator = self.coordinator.clone();
        let event = signal.event.clone();
        match self.worker.try_submit(move || {
            // outcome is reported on the bus
            if let Err(e) = coordinator.process_signal(&signal) {
                debug!(reason = %e, "signal processed without a bet");
            }
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!(event = %event, reason = %e, "signal not accepted");
                false
            }
        }
    }

    /// Feed a stream of signals into the worker. Returns how many were
    /// accepted.
    pub async fn run(&self, mut signals: impl Stream<Item = Signal> + Unpin) -> usize {
        let mut accepted = 0;
        while let Some(signal) = signals.next().await {
            if self.submit_signal(signal) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn enable(&self) {
        self.coordinator.enable();
    }

    pub fn disable(&self) {
        self.coordinator.disable();
    }

    pub fn reset_breaker(&self) {
        self.coordinator.breaker().manual_reset();
    }

    /// Resolve a `MANUAL_CHECK` row after a human compared it against the
    /// external records.
    pub fn resolve(&self, tx_id: &TxId, resolution: Resolution) -> Result<TxStatus, AdminError> {
        self.expect_status(tx_id, TxStatus::ManualCheck)?;
        Ok(self.ledger().resolve_manual_check(tx_id, resolution)?)
    }

    /// Settle a `PLACED` row: a positive payout is a win, zero a loss.
    /// Returns the new balance.
    pub fn settle(&self, tx_id: &TxId, payout: Amount) -> Result<Amount, AdminError> {
        if payout.is_negative() {
            return Err(AdminError::NegativePayout(payout));
        }
        self.expect_status(tx_id, TxStatus::Placed)?;
        let balance = if payout.is_positive() {
            self.money.win(tx_id, payout)?
        } else {
            self.money.loss(tx_id)?
        };
        Ok(balance)
    }

    /// One reconciliation pass against the actor's external balance.
    /// Blocking: the actor is called directly.
    pub fn reconcile_once(&self) -> Option<ReconcileOutcome> {
        reconcile(self.actor.as_ref(), &self.money, &self.bus)
    }

    pub fn status(&self) -> Result<StatusReport, LedgerError> {
        let ledger = self.ledger();
        Ok(StatusReport {
            enabled: self.coordinator.is_enabled(),
            balance: ledger.balance()?,
            pending: ledger.pending()?,
            unsettled: ledger.unsettled_placed()?,
            breaker: self.coordinator.breaker().status(),
            money: self.money.stats(),
            worker: self.worker.stats(),
            bus: self.bus.stats(),
        })
    }

    /// Close the queue and let what is already queued run to completion,
    /// then disable the engine and stop the background tasks and the bus.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.worker.shutdown().await;
        self.coordinator.disable();

        if self.shutdown.send(true).is_err() {
            debug!("no background task left to stop");
        }
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!(reason = %e, "background task ended abnormally");
            }
        }
        self.bus.stop().await;
        info!("shutdown complete");
    }
}

/// Private API
impl App {
    /// Admin input is checked up front: a typo must not reach the ledger as
    /// an illegal transition.
    fn expect_status(&self, tx_id: &TxId, expected: TxStatus) -> Result<(), AdminError> {
        let record = self
            .ledger()
            .get(tx_id)?
            .ok_or_else(|| AdminError::UnknownTx(tx_id.clone()))?;
        if record.status != expected {
            return Err(AdminError::WrongStatus {
                tx_id: tx_id.clone(),
                status: record.status,
                expected,
            });
        }
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let watchdog = tokio::spawn(run_watchdog(
            self.coordinator.clone(),
            self.config.coordinator.watchdog_interval(),
            self.shutdown.subscribe(),
        ));
        let poller = tokio::spawn(poll_balance(
            self.config.balance_poll_interval(),
            self.worker.clone(),
            self.actor.clone(),
            self.money.clone(),
            self.bus.clone(),
            self.shutdown.subscribe(),
        ));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(watchdog);
            tasks.push(poller);
        }
    }
}

/// Periodically queue a reconciliation on the worker, which is the only
/// place actor calls are made from.
async fn poll_balance(
    interval: Duration,
    worker: Arc<Worker>,
    actor: Arc<dyn Actor>,
    money: Arc<MoneyManager>,
    bus: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; skip it so boot is not followed
    // by an instant poll
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (actor, money, bus) = (actor.clone(), money.clone(), bus.clone());
                if let Err(e) = worker.try_submit(move || {
                    reconcile(actor.as_ref(), &money, &bus);
                }) {
                    warn!(reason = %e, "balance poll skipped");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn reconcile(actor: &dyn Actor, money: &MoneyManager, bus: &EventBus) -> Option<ReconcileOutcome> {
    let external = match actor.get_external_balance() {
        Ok(balance) => balance,
        Err(e) => {
            warn!(reason = %e, "external balance unavailable");
            return None;
        }
    };
    match money.reconcile_balances(external) {
        Ok(outcome) => {
            if let ReconcileOutcome::Corrected { delta, balance } = &outcome {
                bus.publish(Event::system(
                    EventKind::BalanceCorrected,
                    format!("corrected by {delta} to {balance}"),
                ));
            }
            Some(outcome)
        }
        Err(e) => {
            error!(reason = %e, "balance reconciliation failed");
            None
        }
    }
}
