//! Failure severity policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::failure::{Failure, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Network or timeout-like. Feeds the burst counter.
    Transient,
    /// Repeated external friction. Feeds the sustained counter.
    Operational,
    /// External session invalidated. Opens immediately, long cooldown.
    StructuralRecoverable,
    /// Opens until a manual reset.
    StructuralFatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Transient => "TRANSIENT",
            Severity::Operational => "OPERATIONAL",
            Severity::StructuralRecoverable => "STRUCTURAL_RECOVERABLE",
            Severity::StructuralFatal => "STRUCTURAL_FATAL",
        };
        f.write_str(name)
    }
}

/// Maps a failure to a severity. Replaceable so deployments can plug in their
/// own policy.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, failure: &Failure) -> Severity;
}

/// Typed kinds first; keyword matching only for failures that arrive
/// without a kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, failure: &Failure) -> Severity {
        match failure.kind {
            Some(kind) => severity_of(kind),
            None => classify_message(&failure.message),
        }
    }
}

pub fn severity_of(kind: FailureKind) -> Severity {
    match kind {
        // validation never reaches the breaker; treat a stray one as friction
        FailureKind::Validation | FailureKind::Operational => Severity::Operational,
        FailureKind::Transient => Severity::Transient,
        FailureKind::StructuralRecoverable => Severity::StructuralRecoverable,
        FailureKind::StructuralFatal | FailureKind::Invariant => Severity::StructuralFatal,
    }
}

const TRANSIENT_KEYWORDS: &[&str] = &["timeout", "timed out", "temporarily", "not found", "database is locked"];
const RECOVERABLE_KEYWORDS: &[&str] = &["cloudflare", "captcha", "login", "session"];
const FATAL_KEYWORDS: &[&str] = &["disk is full", "corrupt", "manual_check", "panic"];

/// Keyword fallback policy for untyped failures.
pub fn classify_message(message: &str) -> Severity {
    let msg = message.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| msg.contains(k));
    if hit(TRANSIENT_KEYWORDS) {
        Severity::Transient
    } else if hit(RECOVERABLE_KEYWORDS) {
        Severity::StructuralRecoverable
    } else if hit(FATAL_KEYWORDS) {
        Severity::StructuralFatal
    } else {
        Severity::Operational
    }
}
