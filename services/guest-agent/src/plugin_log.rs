//! Per-extension command execution log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

pub const COMMAND_LOG_FILE: &str = "CommandExecution.log";

/// Plain-text log at `<log root>/<name>/<version>/CommandExecution.log`.
///
/// Every line also goes to the agent's tracing output. Write failures are
/// only traced.
#[derive(Debug, Clone)]
pub struct PluginLog {
    dir: PathBuf,
    extension: String,
}

impl PluginLog {
    pub fn new(log_root: &Path, name: &str, version: &str) -> Self {
        Self {
            dir: log_root.join(name).join(version),
            extension: format!("{name}-{version}"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(COMMAND_LOG_FILE)
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub fn log(&self, message: &str) {
        info!(extension = %self.extension, "{message}");
        let line = format!("{} {}\n", Utc::now().format("%Y/%m/%d %H:%M:%S"), message);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            debug!(path = %self.path().display(), error = %e, "Unable to write extension log");
        }
    }
}
