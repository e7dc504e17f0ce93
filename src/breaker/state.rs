//! On-disk breaker state.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Serialized form. Times are milliseconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    pub state: BreakerState,
    /// `None` while structurally locked.
    pub cooldown_until: Option<u64>,
    pub structural_lock: bool,
    pub failures: Vec<u64>,
}

/// Atomic JSON file: written to a sibling temp file, synced, then renamed
/// over the previous state.
pub(crate) struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state starts a fresh breaker.
    pub fn load(&self) -> Option<PersistedState> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                error!(path = %self.path.display(), reason = %e, "failed to read breaker state");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), reason = %e, "ignoring unparsable breaker state");
                None
            }
        }
    }

    /// Persist failures are logged, never propagated: the breaker keeps
    /// working from memory.
    pub fn save(&self, state: &PersistedState) {
        if let Err(e) = self.try_save(state) {
            error!(path = %self.path.display(), reason = %e, "failed to save breaker state");
        }
    }

    fn try_save(&self, state: &PersistedState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(state).map_err(std::io::Error::other)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)
    }
}
