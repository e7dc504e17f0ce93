//! Append-only recovery-marker log.
//!
//! A marker is proof that an irreversible action ran for a transaction even
//! though the ledger could not record it. It lives outside the ledger store
//! so it survives a failed ledger write. Markers are read once at boot,
//! consumed by [`LedgerStore::recover_on_boot`](super::LedgerStore::recover_on_boot),
//! then archived.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::failure::{Classify, FailureKind};
use crate::model::TxId;

#[derive(Debug, Error)]
pub enum RecoveryLogError {
    #[error("recovery log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recovery marker could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("recovery log lock poisoned")]
    Poisoned,
}

impl Classify for RecoveryLogError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::StructuralFatal
    }
}

/// Why a marker was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerEvidence {
    /// The actor confirmed the action but the ledger write failed.
    ConfirmedUnrecorded,
    /// The actor raised, but its side channel reports the funds moved.
    SideChannel,
    /// Confirmation arrived after the deadlock watchdog resolved the row.
    LateConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    pub tx_id: TxId,
    pub evidence: MarkerEvidence,
    pub recorded_at: u64,
}

pub struct RecoveryLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl RecoveryLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecoveryLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a marker and fsync before returning.
    pub fn record(&self, marker: &RecoveryMarker) -> Result<(), RecoveryLogError> {
        let mut line = serde_json::to_string(marker)?;
        line.push('\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| RecoveryLogError::Poisoned)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        info!(tx = %marker.tx_id, evidence = ?marker.evidence, "recovery marker recorded");
        Ok(())
    }

    /// Read every marker. Torn or malformed lines (a crash mid-append) are
    /// skipped with a warning.
    pub fn markers(&self) -> Result<Vec<RecoveryMarker>, RecoveryLogError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut markers = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecoveryMarker>(&line) {
                Ok(marker) => markers.push(marker),
                Err(e) => warn!(line = idx + 1, reason = %e, "skipping malformed recovery marker"),
            }
        }
        Ok(markers)
    }

    pub fn marked_tx_ids(&self) -> Result<HashSet<TxId>, RecoveryLogError> {
        Ok(self.markers()?.into_iter().map(|m| m.tx_id).collect())
    }

    /// Move consumed markers aside and start an empty log. Returns the
    /// archive path, or `None` when there was nothing to archive.
    pub fn archive(&self, now_ms: u64) -> Result<Option<PathBuf>, RecoveryLogError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| RecoveryLogError::Poisoned)?;

        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if len == 0 {
            return Ok(None);
        }

        let mut archived = self.path.clone().into_os_string();
        archived.push(format!(".{now_ms}.archived"));
        let archived = PathBuf::from(archived);
        fs::rename(&self.path, &archived)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        info!(archive = %archived.display(), "recovery markers archived");
        Ok(Some(archived))
    }
}
