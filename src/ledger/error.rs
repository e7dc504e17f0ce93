//! Error types for the ledger store.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::Amount;
use crate::failure::{Classify, FailureKind};
use crate::guard::InvariantViolation;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount {0}: must be positive")]
    InvalidAmount(Amount),

    #[error("invalid payout {0}: must not be negative")]
    InvalidPayout(Amount),

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Amount, requested: Amount },

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("balance row missing")]
    MissingBalance,

    #[error("ledger writer lock poisoned")]
    Poisoned,
}

impl LedgerError {
    /// True when the underlying SQLite error is a constraint or trigger abort.
    pub(crate) fn is_constraint(&self) -> bool {
        matches!(
            self,
            LedgerError::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
        )
    }
}

impl Classify for LedgerError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidPayout(_)
            | LedgerError::InsufficientFunds { .. } => FailureKind::Validation,
            LedgerError::Invariant(_) => FailureKind::Invariant,
            LedgerError::Storage(err) => classify_sqlite(err),
            LedgerError::Io(_)
            | LedgerError::MissingBalance
            | LedgerError::Poisoned => FailureKind::StructuralFatal,
        }
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> FailureKind {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => FailureKind::Transient,
            ErrorCode::ConstraintViolation => FailureKind::Invariant,
            _ => FailureKind::StructuralFatal,
        },
        _ => FailureKind::StructuralFatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> LedgerError {
        LedgerError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn busy_database_is_transient() {
        let err = sqlite_failure(rusqlite::ffi::SQLITE_BUSY);
        assert_eq!(err.failure_kind(), FailureKind::Transient);
    }

    #[test]
    fn full_disk_is_fatal() {
        let err = sqlite_failure(rusqlite::ffi::SQLITE_FULL);
        assert_eq!(err.failure_kind(), FailureKind::StructuralFatal);
    }

    #[test]
    fn constraint_is_detected() {
        let err = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT);
        assert!(err.is_constraint());
        assert_eq!(err.failure_kind(), FailureKind::Invariant);
    }

    #[test]
    fn funds_errors_are_validation() {
        let err = LedgerError::InsufficientFunds {
            balance: Amount::from_units(1),
            requested: Amount::from_units(2),
        };
        assert_eq!(err.failure_kind(), FailureKind::Validation);
    }
}
