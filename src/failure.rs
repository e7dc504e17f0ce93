//! Crate-wide failure taxonomy.
//!
//! Every error type that can reach the coordinator reports what *kind* of
//! failure it is. The circuit breaker maps kinds to severities; it never has
//! to look at message text unless a failure arrives without a kind.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Bad stake, odds or request. Rejected before any write.
    Validation,
    /// Network or timeout-like. Retryable, feeds the burst counter.
    Transient,
    /// Repeated external friction. Feeds the sustained counter.
    Operational,
    /// External session or auth invalidated. Long cooldown.
    StructuralRecoverable,
    /// Storage corruption or resource exhaustion. Locks until manual reset.
    StructuralFatal,
    /// Ledger structure can no longer be trusted.
    Invariant,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Transient => "transient",
            FailureKind::Operational => "operational",
            FailureKind::StructuralRecoverable => "structural_recoverable",
            FailureKind::StructuralFatal => "structural_fatal",
            FailureKind::Invariant => "invariant",
        }
    }

    /// Whether this kind should be reported to the circuit breaker at all.
    pub fn counts_against_breaker(self) -> bool {
        !matches!(self, FailureKind::Validation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error that can describe its own failure kind.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// A failure as handed to the circuit breaker: an optional typed kind plus
/// the human-readable message that ends up in logs and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: Option<FailureKind>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    /// A failure without a typed kind, classified from its text.
    pub fn untyped(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn from_error<E: Classify + fmt::Display>(err: &E) -> Self {
        Self::new(err.failure_kind(), err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "[{kind}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}
