//! Error types for signal execution.

use std::fmt;

use thiserror::Error;

use crate::actor::ActorError;
use crate::failure::{Classify, Failure, FailureKind};
use crate::ledger::LedgerError;
use crate::money::StakeError;
use crate::model::MatchKey;

/// What happened to the ledger row after the irreversible action did not
/// confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterAction {
    /// No proof the funds moved; waiting for a human.
    ManualCheck,
    /// The actor reports the funds moved; a recovery marker was written.
    Marked,
}

impl fmt::Display for AfterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AfterAction::ManualCheck => "moved to manual check",
            AfterAction::Marked => "recovery marker written",
        })
    }
}

/// Error returned by [`Coordinator::process`](super::Coordinator::process).
#[derive(Debug, Error)]
pub enum BetError {
    #[error("engine is disabled")]
    Disabled,

    #[error("circuit breaker is open")]
    BreakerOpen,

    #[error("match {0} already has an operation in flight")]
    InFlight(MatchKey),

    #[error("actor session is invalid")]
    SessionInvalid,

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("stake rejected: {0}")]
    Stake(#[from] StakeError),

    #[error("actor failed: {0}")]
    Actor(#[from] ActorError),

    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("irreversible action failed ({after}): {cause}")]
    ActionFailed { cause: Failure, after: AfterAction },

    /// The action was confirmed but `PLACED` could not be written.
    #[error("action confirmed but not recorded: {0}")]
    Unrecorded(LedgerError),

    /// The deadlock watchdog took the operation over and already reported it.
    #[error("operation superseded by the deadlock watchdog")]
    Superseded,

    #[error("action permit lock poisoned")]
    PermitPoisoned,
}

impl Classify for BetError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            BetError::Disabled | BetError::BreakerOpen | BetError::InFlight(_) => {
                FailureKind::Validation
            }
            BetError::SessionInvalid => FailureKind::StructuralRecoverable,
            BetError::EventNotFound(_) => FailureKind::Operational,
            BetError::Stake(e) => e.failure_kind(),
            BetError::Actor(e) => e.failure_kind(),
            BetError::Ledger(e) => e.failure_kind(),
            BetError::ActionFailed { cause, .. } => cause.kind.unwrap_or(FailureKind::Operational),
            BetError::Unrecorded(_) | BetError::PermitPoisoned => FailureKind::StructuralFatal,
            BetError::Superseded => FailureKind::StructuralRecoverable,
        }
    }
}

impl BetError {
    /// The failure handed to the circuit breaker. Actor failures keep their
    /// own (possibly untyped) form so the classifier sees the original.
    pub fn failure(&self) -> Failure {
        match self {
            BetError::Actor(e) => Failure::from(e),
            BetError::ActionFailed { cause, .. } => cause.clone(),
            other => Failure::from_error(other),
        }
    }
}
