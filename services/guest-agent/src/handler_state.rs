//! Persisted lifecycle marker for one installed extension version.
//!
//! The marker is a single-line file at `config/HandlerState` next to the
//! handler manifest. It records whether the last lifecycle command actually
//! completed, which file presence alone cannot tell.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error};

use crate::library::Library;

pub const HANDLER_STATE_FILE: &str = "HandlerState";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerState {
    #[default]
    NotInstalled,
    Installed,
    Enabled,
    Disabled,
}

impl HandlerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerState::NotInstalled => "NotInstalled",
            HandlerState::Installed => "Installed",
            HandlerState::Enabled => "Enabled",
            HandlerState::Disabled => "Disabled",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "notinstalled" => Some(HandlerState::NotInstalled),
            "installed" => Some(HandlerState::Installed),
            "enabled" => Some(HandlerState::Enabled),
            "disabled" => Some(HandlerState::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HandlerStateError {
    #[error("no handler manifest under {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("failed to write handler state: {0}")]
    Io(#[from] std::io::Error),
}

fn state_path(manifest_dir: &Path) -> PathBuf {
    manifest_dir.join("config").join(HANDLER_STATE_FILE)
}

/// Record `state` for the extension installed in `handler_dir`.
pub fn set_state(handler_dir: &Path, state: HandlerState) -> Result<(), HandlerStateError> {
    let manifest_dir = Library::find_manifest_dir(handler_dir).ok_or_else(|| {
        error!(dir = %handler_dir.display(), "Unable to locate handler manifest to set state");
        HandlerStateError::ManifestNotFound(handler_dir.to_path_buf())
    })?;

    let path = state_path(&manifest_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{}\n", state.as_str()))?;
    debug!(dir = %handler_dir.display(), state = %state, "Handler state updated");
    Ok(())
}

/// Read the recorded state, treating anything unreadable as NotInstalled.
pub fn get_state(handler_dir: &Path) -> HandlerState {
    let manifest_dir =
        Library::find_manifest_dir(handler_dir).unwrap_or_else(|| handler_dir.to_path_buf());
    std::fs::read_to_string(state_path(&manifest_dir))
        .ok()
        .and_then(|contents| contents.lines().next().and_then(HandlerState::parse))
        .unwrap_or_default()
}
