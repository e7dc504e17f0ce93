//! Ledger schema. Invariants 1-4 live here as constraints and triggers so
//! they hold even against writes that bypass the application code.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, params};

use crate::Amount;
use crate::model::TxStatus;

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS journal (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id       TEXT    NOT NULL UNIQUE,
    amount      INTEGER NOT NULL CHECK (typeof(amount) = 'integer' AND amount > 0),
    status      TEXT    NOT NULL CHECK (status IN
                    ('RESERVED', 'PRE_COMMIT', 'PLACED', 'MANUAL_CHECK', 'VOID', 'SETTLED')),
    payout      INTEGER NOT NULL DEFAULT 0 CHECK (typeof(payout) = 'integer' AND payout >= 0),
    table_id    INTEGER NOT NULL DEFAULT 1,
    match_key   TEXT    NOT NULL,
    label       TEXT    NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journal_status ON journal(status);
CREATE INDEX IF NOT EXISTS idx_journal_match_key ON journal(match_key);

CREATE TABLE IF NOT EXISTS balance (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    current_balance INTEGER NOT NULL CHECK (current_balance >= 0),
    peak_balance    INTEGER NOT NULL,
    initial_balance INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS balance_deltas (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id       TEXT,
    delta       INTEGER NOT NULL,
    reason      TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS balance_peak_monotonic
BEFORE UPDATE OF peak_balance ON balance
WHEN NEW.peak_balance < OLD.peak_balance
BEGIN
    SELECT RAISE(ABORT, 'peak_balance may not decrease');
END;

CREATE TRIGGER IF NOT EXISTS journal_status_transition
BEFORE UPDATE OF status ON journal
WHEN NEW.status <> OLD.status AND NOT (
       (OLD.status = 'RESERVED'     AND NEW.status IN ('PRE_COMMIT', 'VOID'))
    OR (OLD.status = 'PRE_COMMIT'   AND NEW.status IN ('PLACED', 'MANUAL_CHECK'))
    OR (OLD.status = 'MANUAL_CHECK' AND NEW.status IN ('PLACED', 'VOID'))
    OR (OLD.status = 'PLACED'       AND NEW.status = 'SETTLED')
)
BEGIN
    SELECT RAISE(ABORT, 'illegal status transition');
END;

CREATE TRIGGER IF NOT EXISTS journal_identity_immutable
BEFORE UPDATE OF tx_id, amount ON journal
WHEN NEW.tx_id <> OLD.tx_id OR NEW.amount <> OLD.amount
BEGIN
    SELECT RAISE(ABORT, 'tx_id and amount are immutable');
END;

CREATE TRIGGER IF NOT EXISTS journal_no_delete
BEFORE DELETE ON journal
BEGIN
    SELECT RAISE(ABORT, 'journal rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS balance_deltas_no_update
BEFORE UPDATE ON balance_deltas
BEGIN
    SELECT RAISE(ABORT, 'balance_deltas is append-only');
END;

CREATE TRIGGER IF NOT EXISTS balance_deltas_no_delete
BEFORE DELETE ON balance_deltas
BEGIN
    SELECT RAISE(ABORT, 'balance_deltas is append-only');
END;
"#;

/// Create tables and seed the singleton balance row. The initial balance is
/// only used the first time a store is created.
pub(crate) fn create_tables(conn: &Connection, initial_balance: Amount) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO balance (id, current_balance, peak_balance, initial_balance)
         VALUES (1, ?1, ?1, ?1)",
        params![initial_balance],
    )?;
    Ok(())
}

impl ToSql for Amount {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.scaled()))
    }
}

impl FromSql for Amount {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(Amount::from_scaled)
    }
}

impl ToSql for TxStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TxStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}
