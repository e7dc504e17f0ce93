//! Durable ledger store.
//!
//! The ledger is the only place financial truth lives. Rows follow the
//! lifecycle `RESERVED -> PRE_COMMIT -> PLACED -> SETTLED`, with `VOID` and
//! `MANUAL_CHECK` as the abort and shadow-zone exits. Every write runs as one
//! `BEGIN IMMEDIATE` SQLite transaction on a single writer connection, is
//! checked by the [`InvariantGuard`] before commit, and records each balance
//! change in the append-only `balance_deltas` table. Reads go through a
//! separate read-only connection and never wait on the writer.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params,
};
use tracing::{debug, info, warn};

use crate::Amount;
use crate::clock::{Clock, SystemClock};
use crate::guard::{InvariantGuard, InvariantViolation};
use crate::model::{BalanceSnapshot, Correlation, MatchKey, TxId, TxRecord, TxStatus};

mod error;
pub mod recovery;
mod schema;

pub use error::LedgerError;

const RECORD_COLUMNS: &str =
    "tx_id, amount, status, payout, table_id, match_key, label, created_at";

/// Result of [`LedgerStore::rollback`]. Only `Refunded` moved money.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Refunded(Amount),
    /// Already voided by an earlier rollback. No-op.
    AlreadyVoid,
    /// The row has moved past `RESERVED`; the action may have run. No-op.
    NotReserved(TxStatus),
}

/// Human verdict on a `MANUAL_CHECK` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The external records show the action ran.
    Placed,
    /// The external records show nothing happened: refund.
    NotPlaced,
}

/// What [`LedgerStore::recover_on_boot`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `RESERVED` rows voided and refunded.
    pub refunded: Vec<TxId>,
    /// `PRE_COMMIT` rows without a marker, now `MANUAL_CHECK`.
    pub demoted: Vec<TxId>,
    /// Rows promoted to `PLACED` on the strength of a recovery marker.
    pub promoted: Vec<TxId>,
    /// Markers that matched no row awaiting recovery.
    pub orphan_markers: Vec<TxId>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.refunded.is_empty()
            && self.demoted.is_empty()
            && self.promoted.is_empty()
            && self.orphan_markers.is_empty()
    }
}

/// Result of a successful [`LedgerStore::audit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    pub balance: BalanceSnapshot,
    pub delta_sum: Amount,
    pub rows: u64,
}

pub struct LedgerStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    guard: InvariantGuard,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

/// Public API
impl LedgerStore {
    /// Open (or create) the ledger at `path`. `initial_balance` only seeds a
    /// brand-new store; an existing store keeps its balance.
    pub fn open(
        path: impl AsRef<Path>,
        initial_balance: Amount,
        guard: InvariantGuard,
    ) -> Result<Self, LedgerError> {
        Self::open_with_clock(path, initial_balance, guard, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        initial_balance: Amount,
        guard: InvariantGuard,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        if initial_balance.is_negative() {
            return Err(LedgerError::InvalidAmount(initial_balance));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(&path)?;
        let mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        writer.execute_batch("PRAGMA synchronous=FULL;")?;
        writer.busy_timeout(Duration::from_secs(5))?;
        schema::create_tables(&writer, initial_balance)?;

        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(Duration::from_secs(5))?;

        info!(path = %path.display(), journal_mode = %mode, "ledger opened");
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            guard,
            clock,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn guard(&self) -> &InvariantGuard {
        &self.guard
    }

    /// Insert a `RESERVED` row and take `amount` off the balance.
    ///
    /// - Reject non-positive amounts
    /// - Reject a reused `tx_id` as an invariant violation
    /// - Reject amounts above the current balance
    pub fn reserve(
        &self,
        tx_id: &TxId,
        amount: Amount,
        correlation: &Correlation,
    ) -> Result<(), LedgerError> {
        let result = if amount.is_positive() {
            self.write(|tx, now| {
                if fetch(tx, tx_id)?.is_some() {
                    return Err(self
                        .guard
                        .escalate(InvariantViolation::DuplicateTxId(tx_id.clone()))
                        .into());
                }
                tx.execute(
                    "INSERT INTO journal
                        (tx_id, amount, status, payout, table_id, match_key, label, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        tx_id.as_str(),
                        amount,
                        TxStatus::Reserved,
                        correlation.table_id,
                        correlation.match_key.as_str(),
                        correlation.label,
                        now as i64,
                    ],
                )?;
                apply_delta(tx, Some(tx_id), -amount, "reserve", now)?;
                Ok(())
            })
        } else {
            Err(LedgerError::InvalidAmount(amount))
        };
        Self::log_result("reserve", tx_id, Some(amount), &result);
        result
    }

    /// Write-ahead intent: the irreversible action is about to run.
    pub fn mark_pre_commit(&self, tx_id: &TxId) -> Result<(), LedgerError> {
        let result = self.write(|tx, now| {
            self.load_for_transition(tx, tx_id, TxStatus::PreCommit)?;
            set_status(tx, tx_id, TxStatus::PreCommit, now)
        });
        Self::log_result("pre_commit", tx_id, None, &result);
        result
    }

    pub fn mark_placed(&self, tx_id: &TxId) -> Result<(), LedgerError> {
        let result = self.write(|tx, now| {
            self.load_for_transition(tx, tx_id, TxStatus::Placed)?;
            set_status(tx, tx_id, TxStatus::Placed, now)
        });
        Self::log_result("placed", tx_id, None, &result);
        result
    }

    /// Move a `PRE_COMMIT` row into the shadow zone. No money moves.
    pub fn demote_to_manual_check(&self, tx_id: &TxId) -> Result<(), LedgerError> {
        let result = self.write(|tx, now| {
            self.load_for_transition(tx, tx_id, TxStatus::ManualCheck)?;
            set_status(tx, tx_id, TxStatus::ManualCheck, now)
        });
        Self::log_result("manual_check", tx_id, None, &result);
        result
    }

    /// Settle a `PLACED` row. The payout is credited to the balance (zero for
    /// a lost bet) and the peak advances if the balance passes it. Returns the
    /// new balance.
    pub fn settle(&self, tx_id: &TxId, payout: Amount) -> Result<Amount, LedgerError> {
        let result = if payout.is_negative() {
            Err(LedgerError::InvalidPayout(payout))
        } else {
            self.write(|tx, now| {
                self.load_for_transition(tx, tx_id, TxStatus::Settled)?;
                tx.execute(
                    "UPDATE journal SET status = ?1, payout = ?2, updated_at = ?3 WHERE tx_id = ?4",
                    params![TxStatus::Settled, payout, now as i64, tx_id.as_str()],
                )?;
                if payout.is_positive() {
                    apply_delta(tx, Some(tx_id), payout, "settle", now)
                } else {
                    Ok(read_balance(tx)?.current)
                }
            })
        };
        Self::log_result("settle", tx_id, Some(payout), &result);
        result
    }

    /// Void a `RESERVED` row and refund its amount.
    ///
    /// Calling it again on the same row is a no-op, and so is calling it once
    /// the row has moved past `RESERVED`: money never comes back
    /// automatically after the write-ahead intent.
    pub fn rollback(&self, tx_id: &TxId) -> Result<RollbackOutcome, LedgerError> {
        let result = self.write(|tx, now| match fetch(tx, tx_id)? {
            None => Err(self
                .guard
                .escalate(InvariantViolation::UnknownTx {
                    tx_id: tx_id.clone(),
                    to: TxStatus::Void,
                })
                .into()),
            Some(record) if record.status == TxStatus::Void => Ok(RollbackOutcome::AlreadyVoid),
            Some(record) if record.status != TxStatus::Reserved => {
                Ok(RollbackOutcome::NotReserved(record.status))
            }
            Some(record) => {
                set_status(tx, tx_id, TxStatus::Void, now)?;
                apply_delta(tx, Some(tx_id), record.amount, "refund", now)?;
                Ok(RollbackOutcome::Refunded(record.amount))
            }
        });
        match &result {
            Ok(RollbackOutcome::Refunded(amount)) => {
                info!(tx = %tx_id, amount = %amount, "rollback applied")
            }
            Ok(outcome) => warn!(tx = %tx_id, outcome = ?outcome, "rollback skipped"),
            Err(e) => warn!(tx = %tx_id, reason = %e, "rollback failed"),
        }
        result
    }

    /// Close out a `MANUAL_CHECK` row after a human compared it against the
    /// external records. Returns the row's new status.
    pub fn resolve_manual_check(
        &self,
        tx_id: &TxId,
        resolution: Resolution,
    ) -> Result<TxStatus, LedgerError> {
        let target = match resolution {
            Resolution::Placed => TxStatus::Placed,
            Resolution::NotPlaced => TxStatus::Void,
        };
        let result = self.write(|tx, now| {
            let record = self.load_for_transition(tx, tx_id, target)?;
            if record.status != TxStatus::ManualCheck {
                // RESERVED -> VOID is legal in the table but not a resolution
                return Err(self
                    .guard
                    .escalate(InvariantViolation::IllegalTransition {
                        tx_id: tx_id.clone(),
                        from: record.status,
                        to: target,
                    })
                    .into());
            }
            set_status(tx, tx_id, target, now)?;
            if target == TxStatus::Void {
                apply_delta(tx, Some(tx_id), record.amount, "manual_refund", now)?;
            }
            Ok(target)
        });
        Self::log_result("resolve", tx_id, None, &result);
        result
    }

    /// Apply an out-of-band balance correction (external reconciliation).
    /// Returns the new balance.
    pub fn apply_correction(&self, delta: Amount, reason: &str) -> Result<Amount, LedgerError> {
        let result = self.write(|tx, now| apply_delta(tx, None, delta, reason, now));
        match &result {
            Ok(balance) => info!(delta = %delta, balance = %balance, reason, "balance corrected"),
            Err(e) => warn!(delta = %delta, reason = %e, "balance correction failed"),
        }
        result
    }

    /// Run once at process start, before any signal is admitted.
    ///
    /// - `RESERVED` rows are voided and refunded: the action never started
    /// - `PRE_COMMIT` rows with a marker are promoted to `PLACED`
    /// - other `PRE_COMMIT` rows are demoted to `MANUAL_CHECK`
    /// - `MANUAL_CHECK` rows with a marker are promoted to `PLACED`
    ///
    /// Everything happens in one transaction.
    pub fn recover_on_boot(&self, markers: &HashSet<TxId>) -> Result<RecoveryReport, LedgerError> {
        let report = self.write(|tx, now| {
            let mut report = RecoveryReport::default();
            let in_doubt = query_records(
                tx,
                "WHERE status IN ('RESERVED', 'PRE_COMMIT', 'MANUAL_CHECK') ORDER BY created_at, id",
            )?;

            let mut matched = HashSet::new();
            for record in in_doubt {
                let marked = markers.contains(&record.tx_id);
                let target = match (record.status, marked) {
                    (TxStatus::Reserved, _) => TxStatus::Void,
                    (TxStatus::PreCommit, true) | (TxStatus::ManualCheck, true) => TxStatus::Placed,
                    (TxStatus::PreCommit, false) => TxStatus::ManualCheck,
                    _ => continue,
                };
                self.guard
                    .check_transition(&record.tx_id, Some(record.status), target)?;
                set_status(tx, &record.tx_id, target, now)?;
                if marked {
                    matched.insert(record.tx_id.clone());
                }

                match target {
                    TxStatus::Void => {
                        apply_delta(tx, Some(&record.tx_id), record.amount, "boot_refund", now)?;
                        report.refunded.push(record.tx_id);
                    }
                    TxStatus::Placed => report.promoted.push(record.tx_id),
                    _ => report.demoted.push(record.tx_id),
                }
            }

            let mut orphans: Vec<TxId> = markers.difference(&matched).cloned().collect();
            orphans.sort();
            report.orphan_markers = orphans;
            Ok(report)
        })?;

        for tx_id in &report.refunded {
            info!(tx = %tx_id, "boot recovery: reserved row refunded");
        }
        for tx_id in &report.promoted {
            info!(tx = %tx_id, "boot recovery: promoted to placed from marker");
        }
        for tx_id in &report.demoted {
            warn!(tx = %tx_id, "boot recovery: outcome unknown, demoted to manual check");
        }
        for tx_id in &report.orphan_markers {
            warn!(tx = %tx_id, "boot recovery: marker matches no row awaiting recovery");
        }
        Ok(report)
    }

    /// Verify invariant 5 and the uniqueness of transaction ids against the
    /// committed state.
    pub fn audit(&self) -> Result<AuditReport, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        let balance = read_balance(&conn)?;
        let delta_sum: Amount =
            conn.query_row("SELECT COALESCE(SUM(delta), 0) FROM balance_deltas", [], |row| {
                row.get(0)
            })?;
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
        self.guard.pre_commit_check(&conn)?;

        let moved = balance.current - balance.initial;
        if delta_sum != moved {
            return Err(self
                .guard
                .escalate(InvariantViolation::DeltaMismatch {
                    deltas: delta_sum,
                    moved,
                })
                .into());
        }
        Ok(AuditReport {
            balance,
            delta_sum,
            rows: rows as u64,
        })
    }

    pub fn balance(&self) -> Result<BalanceSnapshot, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        read_balance(&conn)
    }

    pub fn get(&self, tx_id: &TxId) -> Result<Option<TxRecord>, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        fetch(&conn, tx_id)
    }

    /// Rows not in a terminal state, oldest first.
    pub fn pending(&self) -> Result<Vec<TxRecord>, LedgerError> {
        self.read_records("WHERE status NOT IN ('VOID', 'SETTLED') ORDER BY created_at, id")
    }

    /// `PLACED` rows still waiting for a result.
    pub fn unsettled_placed(&self) -> Result<Vec<TxRecord>, LedgerError> {
        self.read_records("WHERE status = 'PLACED' ORDER BY created_at, id")
    }

    /// Every row, oldest first.
    pub fn records(&self) -> Result<Vec<TxRecord>, LedgerError> {
        self.read_records("ORDER BY created_at, id")
    }

    /// Sum of amounts of every non-terminal row.
    pub fn pending_exposure(&self) -> Result<Amount, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM journal WHERE status NOT IN ('VOID', 'SETTLED')",
            [],
            |row| row.get(0),
        )?)
    }

    /// Whether an unsettled row (anything but `VOID` or `SETTLED`) already
    /// exists for this match.
    pub fn has_pending_match(&self, match_key: &MatchKey) -> Result<bool, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM journal
                 WHERE match_key = ?1 AND status NOT IN ('VOID', 'SETTLED')
                 LIMIT 1",
                params![match_key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Number of rows whose outcome is not yet known (`RESERVED`,
    /// `PRE_COMMIT`, `MANUAL_CHECK`).
    pub fn in_doubt_count(&self) -> Result<u64, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM journal WHERE status IN ('RESERVED', 'PRE_COMMIT', 'MANUAL_CHECK')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Rows placed externally whose payout the ledger has not seen yet.
    pub fn unsettled_count(&self) -> Result<u64, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM journal WHERE status = 'PLACED'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Private API
impl LedgerStore {
    /// Run `f` as one immediate transaction on the writer connection.
    ///
    /// Any error rolls the whole unit back. Storage constraint and trigger
    /// aborts are escalated through the guard.
    fn write<T>(
        &self,
        f: impl FnOnce(&Connection, u64) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.writer.lock().map_err(|_| LedgerError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = self.clock.now_ms();

        let value = f(&tx, now).map_err(|e| self.escalate_constraint(e))?;
        self.guard.pre_commit_check(&tx)?;
        tx.commit().map_err(|e| self.escalate_constraint(e.into()))?;
        Ok(value)
    }

    fn escalate_constraint(&self, err: LedgerError) -> LedgerError {
        if err.is_constraint() {
            LedgerError::Invariant(
                self.guard
                    .escalate(InvariantViolation::Constraint(err.to_string())),
            )
        } else {
            err
        }
    }

    /// Load the row and check that `to` is a legal next status for it.
    fn load_for_transition(
        &self,
        conn: &Connection,
        tx_id: &TxId,
        to: TxStatus,
    ) -> Result<TxRecord, LedgerError> {
        let record = fetch(conn, tx_id)?;
        self.guard
            .check_transition(tx_id, record.as_ref().map(|r| r.status), to)?;
        record.ok_or_else(|| {
            InvariantViolation::UnknownTx {
                tx_id: tx_id.clone(),
                to,
            }
            .into()
        })
    }

    fn read_records(&self, clause: &str) -> Result<Vec<TxRecord>, LedgerError> {
        let conn = self.reader.lock().map_err(|_| LedgerError::Poisoned)?;
        query_records(&conn, clause)
    }

    /// Small helper to log write results
    fn log_result<T, E: std::fmt::Display>(
        op: &str,
        tx_id: &TxId,
        amount: Option<Amount>,
        result: &Result<T, E>,
    ) {
        match (result, amount) {
            (Ok(_), Some(amount)) => debug!(tx = %tx_id, amount = %amount, "{op} applied"),
            (Ok(_), None) => debug!(tx = %tx_id, "{op} applied"),
            (Err(e), Some(amount)) => {
                warn!(tx = %tx_id, amount = %amount, reason = %e, "{op} rejected")
            }
            (Err(e), None) => warn!(tx = %tx_id, reason = %e, "{op} rejected"),
        }
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TxRecord> {
    Ok(TxRecord {
        tx_id: TxId::from(row.get::<_, String>(0)?),
        amount: row.get(1)?,
        status: row.get(2)?,
        payout: row.get(3)?,
        table_id: row.get(4)?,
        match_key: MatchKey::from_hash(row.get::<_, String>(5)?),
        label: row.get(6)?,
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

fn fetch(conn: &Connection, tx_id: &TxId) -> Result<Option<TxRecord>, LedgerError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM journal WHERE tx_id = ?1");
    Ok(conn
        .query_row(&sql, params![tx_id.as_str()], record_from_row)
        .optional()?)
}

fn query_records(conn: &Connection, clause: &str) -> Result<Vec<TxRecord>, LedgerError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM journal {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], record_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn set_status(conn: &Connection, tx_id: &TxId, to: TxStatus, now: u64) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE journal SET status = ?1, updated_at = ?2 WHERE tx_id = ?3",
        params![to, now as i64, tx_id.as_str()],
    )?;
    Ok(())
}

fn read_balance(conn: &Connection) -> Result<BalanceSnapshot, LedgerError> {
    conn.query_row(
        "SELECT current_balance, peak_balance, initial_balance FROM balance WHERE id = 1",
        [],
        |row| {
            Ok(BalanceSnapshot {
                current: row.get(0)?,
                peak: row.get(1)?,
                initial: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(LedgerError::MissingBalance)
}

/// Move the balance by `delta`, raise the peak if needed and journal the
/// change. Returns the new balance.
fn apply_delta(
    conn: &Connection,
    tx_id: Option<&TxId>,
    delta: Amount,
    reason: &str,
    now: u64,
) -> Result<Amount, LedgerError> {
    let snapshot = read_balance(conn)?;
    let next = snapshot.current + delta;
    if next.is_negative() {
        return Err(LedgerError::InsufficientFunds {
            balance: snapshot.current,
            requested: -delta,
        });
    }
    let peak = snapshot.peak.max(next);
    conn.execute(
        "UPDATE balance SET current_balance = ?1, peak_balance = ?2 WHERE id = 1",
        params![next, peak],
    )?;
    conn.execute(
        "INSERT INTO balance_deltas (tx_id, delta, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![tx_id.map(TxId::as_str), delta, reason, now as i64],
    )?;
    Ok(next)
}
