//! Core domain types shared by the ledger, the coordinator and the bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// Transaction identifier. Generated by the coordinator, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn generate() -> Self {
        TxId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        TxId(value.to_string())
    }
}

impl From<String> for TxId {
    fn from(value: String) -> Self {
        TxId(value)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized hash of a real-world event, used for duplicate detection.
///
/// Case, punctuation and spacing are folded before hashing, so
/// `"Inter - Milan"` and `"inter milan"` collide on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(String);

impl MatchKey {
    pub fn new(table_id: u32, event: &str, market: &str) -> Self {
        let canonical = format!(
            "{table_id}|{}|{}",
            normalize(event),
            normalize(market)
        );
        MatchKey(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// Wrap a hash that was already computed, e.g. when reading a row back.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        MatchKey(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is enough to correlate log lines
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lifecycle of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Funds reserved, the external action has certainly not started.
    Reserved,
    /// Write-ahead intent: the external action may be in progress.
    PreCommit,
    /// The external action is confirmed.
    Placed,
    /// Outcome unknown, a human must reconcile against the external records.
    ManualCheck,
    /// Aborted and refunded. Terminal.
    Void,
    /// Paid out. Terminal.
    Settled,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Reserved => "RESERVED",
            TxStatus::PreCommit => "PRE_COMMIT",
            TxStatus::Placed => "PLACED",
            TxStatus::ManualCheck => "MANUAL_CHECK",
            TxStatus::Void => "VOID",
            TxStatus::Settled => "SETTLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Void | TxStatus::Settled)
    }

    /// The authoritative transition table.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Reserved, PreCommit)
                | (Reserved, Void)
                | (PreCommit, Placed)
                | (PreCommit, ManualCheck)
                | (ManualCheck, Placed)
                | (ManualCheck, Void)
                | (Placed, Settled)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVED" => Ok(TxStatus::Reserved),
            "PRE_COMMIT" => Ok(TxStatus::PreCommit),
            "PLACED" => Ok(TxStatus::Placed),
            "MANUAL_CHECK" => Ok(TxStatus::ManualCheck),
            "VOID" => Ok(TxStatus::Void),
            "SETTLED" => Ok(TxStatus::Settled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Correlation fields stored with every ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub table_id: u32,
    pub match_key: MatchKey,
    /// Free-text event label, for humans only. Never used for dedup.
    pub label: String,
}

/// One row of the ledger journal.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    pub tx_id: TxId,
    pub amount: Amount,
    pub status: TxStatus,
    pub payout: Amount,
    pub table_id: u32,
    pub match_key: MatchKey,
    pub label: String,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub current: Amount,
    pub peak: Amount,
    pub initial: Amount,
}

/// A betting instruction, already parsed by whatever ingests messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub event: String,
    pub market: String,
    pub stake: Amount,
    pub table_id: u32,
}

impl Signal {
    pub fn new(event: impl Into<String>, market: impl Into<String>, stake: Amount) -> Self {
        Self {
            event: event.into(),
            market: market.into(),
            stake,
            table_id: 1,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey::new(self.table_id, &self.event, &self.market)
    }

    pub fn correlation(&self) -> Correlation {
        Correlation {
            table_id: self.table_id,
            match_key: self.match_key(),
            label: self.event.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_key_ignores_formatting() {
        let a = MatchKey::new(1, "Inter - Milan", "1X2 Home");
        let b = MatchKey::new(1, "  inter   MILAN ", "1x2 home");
        assert_eq!(a, b);
    }

    #[test]
    fn match_key_separates_tables_and_markets() {
        let base = MatchKey::new(1, "Inter - Milan", "home");
        assert_ne!(base, MatchKey::new(2, "Inter - Milan", "home"));
        assert_ne!(base, MatchKey::new(1, "Inter - Milan", "away"));
    }

    #[test]
    fn tx_ids_are_unique() {
        assert_ne!(TxId::generate(), TxId::generate());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TxStatus::Reserved,
            TxStatus::PreCommit,
            TxStatus::Placed,
            TxStatus::ManualCheck,
            TxStatus::Void,
            TxStatus::Settled,
        ] {
            assert_eq!(status.as_str().parse::<TxStatus>(), Ok(status));
        }
        assert!("PENDING".parse::<TxStatus>().is_err());
    }

    #[test]
    fn settled_only_from_placed() {
        assert!(TxStatus::Placed.can_transition_to(TxStatus::Settled));
        for from in [
            TxStatus::Reserved,
            TxStatus::PreCommit,
            TxStatus::ManualCheck,
            TxStatus::Void,
            TxStatus::Settled,
        ] {
            assert!(!from.can_transition_to(TxStatus::Settled), "{from}");
        }
    }

    #[test]
    fn terminal_states_have_no_successor() {
        for next in [TxStatus::Reserved, TxStatus::Placed, TxStatus::Void] {
            assert!(!TxStatus::Void.can_transition_to(next));
            assert!(!TxStatus::Settled.can_transition_to(next));
        }
    }
}
