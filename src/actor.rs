//! The external capability the coordinator drives.
//!
//! An [`Actor`] performs the navigation, quoting and the irreversible action
//! itself. None of its calls are assumed to be crash-consistent; every one
//! may block, fail or lie, and the coordinator only trusts what it can
//! write to the ledger.

use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::failure::{Classify, Failure, FailureKind};

/// Side-channel answer to "did the action actually happen?" after the
/// action call raised or returned `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    /// Funds moved externally even though the call did not confirm it.
    Executed,
    /// The actor believes nothing happened externally. Logged for the
    /// human resolving the row; it never refunds on its own.
    NotExecuted,
    /// No way to tell.
    Unknown,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActorError {
    #[error("session invalid: {0}")]
    Session(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("quote unavailable: {0}")]
    Quote(String),

    #[error("{0}")]
    Operational(String),

    #[error("{0}")]
    Fatal(String),

    /// An error the actor could not type. Classified from its text.
    #[error("{0}")]
    Untyped(String),
}

impl Classify for ActorError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ActorError::Session(_) => FailureKind::StructuralRecoverable,
            ActorError::Timeout(_) | ActorError::Network(_) => FailureKind::Transient,
            ActorError::Quote(_) | ActorError::Operational(_) | ActorError::Untyped(_) => {
                FailureKind::Operational
            }
            ActorError::Fatal(_) => FailureKind::StructuralFatal,
        }
    }
}

impl From<&ActorError> for Failure {
    fn from(err: &ActorError) -> Self {
        match err {
            ActorError::Untyped(message) => Failure::untyped(message.clone()),
            typed => Failure::from_error(typed),
        }
    }
}

/// Capabilities consumed by the coordinator. Calls are blocking and are only
/// ever made from worker threads.
pub trait Actor: Send + Sync {
    fn is_session_valid(&self) -> bool;

    /// Bring the target event on screen. `Ok(false)` means not found.
    fn navigate(&self, target: &str) -> Result<bool, ActorError>;

    /// Current decimal odds for `market` on `target`.
    fn get_quote(&self, target: &str, market: &str) -> Result<f64, ActorError>;

    /// The irreversible action. `Ok(true)` is the only confirmation.
    fn execute_irreversible_action(
        &self,
        target: &str,
        market: &str,
        stake: Amount,
    ) -> Result<bool, ActorError>;

    /// Queried after `execute_irreversible_action` raised or returned
    /// `false`, for the call that just finished.
    fn action_evidence(&self) -> Evidence {
        Evidence::Unknown
    }

    fn get_external_balance(&self) -> Result<Amount, ActorError>;
}

/// Dry-run actor: quotes fixed odds and keeps a simulated external balance.
/// Never touches a real bookmaker.
pub struct PaperActor {
    odds: f64,
    balance: Mutex<Amount>,
    placed: Mutex<Vec<(String, String, Amount)>>,
}

impl PaperActor {
    pub fn new(balance: Amount) -> Self {
        Self::with_odds(balance, 2.0)
    }

    pub fn with_odds(balance: Amount, odds: f64) -> Self {
        Self {
            odds,
            balance: Mutex::new(balance),
            placed: Mutex::new(Vec::new()),
        }
    }

    /// Actions performed so far, as `(target, market, stake)`.
    pub fn placed(&self) -> Vec<(String, String, Amount)> {
        self.placed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Actor for PaperActor {
    fn is_session_valid(&self) -> bool {
        true
    }

    fn navigate(&self, _target: &str) -> Result<bool, ActorError> {
        Ok(true)
    }

    fn get_quote(&self, _target: &str, _market: &str) -> Result<f64, ActorError> {
        Ok(self.odds)
    }

    fn execute_irreversible_action(
        &self,
        target: &str,
        market: &str,
        stake: Amount,
    ) -> Result<bool, ActorError> {
        let mut balance = self
            .balance
            .lock()
            .map_err(|_| ActorError::Fatal("paper balance lock poisoned".into()))?;
        if stake > *balance {
            return Ok(false);
        }
        *balance -= stake;
        if let Ok(mut placed) = self.placed.lock() {
            placed.push((target.to_string(), market.to_string(), stake));
        }
        info!(event = target, market, stake = %stake, "paper action executed");
        Ok(true)
    }

    fn action_evidence(&self) -> Evidence {
        // a refused paper action never touched the simulated balance
        Evidence::NotExecuted
    }

    fn get_external_balance(&self) -> Result<Amount, ActorError> {
        self.balance
            .lock()
            .map(|b| *b)
            .map_err(|_| ActorError::Fatal("paper balance lock poisoned".into()))
    }
}
