//! Telemetry events and the on-disk event queue.
//!
//! Any component can queue an event; the batcher later drains the queue.
//! Each event is one file, written as `<micros>.tmp` and linked to
//! `<micros>.tld` so the batcher never sees a partial record. Both names are
//! claimed exclusively, so concurrent writers never share a record.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Provider id for extension lifecycle events.
pub const EXTENSION_EVENT_PROVIDER: &str = "69B669B9-4AF8-4C50-BDC4-6006FA76E975";
pub const EXTENSION_EVENT_ID: u32 = 1;

/// The queue refuses new events once it holds more files than this.
pub const MAX_QUEUED_EVENTS: usize = 1000;

pub const GUEST_AGENT_VERSION: &str = "WALinuxAgent-2.0.16";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event queue full ({0} files)")]
    QueueFull(usize),

    #[error("event queue io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Operation names reported in the `Operation` param.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    HeartBeat,
    Provision,
    Install,
    UnInstall,
    Disable,
    Enable,
    Download,
    Upgrade,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::HeartBeat => "HeartBeat",
            Operation::Provision => "Provision",
            Operation::Install => "Install",
            Operation::UnInstall => "UnInstall",
            Operation::Disable => "Disable",
            Operation::Enable => "Enable",
            Operation::Download => "Download",
            Operation::Upgrade => "Upgrade",
            Operation::Update => "Update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParamValue {
    WideString(String),
    UInt64(u64),
    Bool(bool),
    Float64(f64),
}

impl ParamValue {
    /// Wire type tag.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ParamValue::WideString(_) => "mt:wstr",
            ParamValue::UInt64(_) => "mt:uint64",
            ParamValue::Bool(_) => "mt:bool",
            ParamValue::Float64(_) => "mt:float64",
        }
    }

    pub fn render(&self) -> String {
        match self {
            ParamValue::WideString(s) => s.clone(),
            ParamValue::UInt64(n) => n.to_string(),
            ParamValue::Bool(true) => "True".to_string(),
            ParamValue::Bool(false) => "False".to_string(),
            ParamValue::Float64(f) => f.to_string(),
        }
    }

    /// Blank values are not overwritten by, and do not overwrite, identity
    /// decoration.
    pub fn is_blank(&self) -> bool {
        match self {
            ParamValue::WideString(s) => s.is_empty(),
            ParamValue::UInt64(n) => *n == 0,
            ParamValue::Bool(b) => !b,
            ParamValue::Float64(f) => *f == 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub provider_id: String,
    pub event_id: u32,
    pub params: Vec<Param>,
}

impl TelemetryEvent {
    /// An extension lifecycle event with the full standard field set.
    pub fn extension(
        name: &str,
        op: Operation,
        success: bool,
        duration_secs: u64,
        version: &str,
        message: &str,
    ) -> Self {
        use ParamValue::{Bool, UInt64, WideString};

        let blank = || WideString(String::new());
        let params = vec![
            ("OpcodeName", blank()),
            ("KeywordName", blank()),
            ("TaskName", blank()),
            ("TenantName", blank()),
            ("RoleName", blank()),
            ("RoleInstanceName", blank()),
            ("ContainerId", blank()),
            ("ExecutionMode", WideString("IAAS".to_string())),
            ("OSVersion", blank()),
            ("GAVersion", blank()),
            ("RAM", UInt64(0)),
            ("Processors", UInt64(0)),
            ("Name", WideString(name.to_string())),
            ("Version", WideString(version.to_string())),
            ("IsInternal", Bool(false)),
            ("Operation", WideString(op.as_str().to_string())),
            ("OperationSuccess", Bool(success)),
            ("ExtensionType", blank()),
            ("Message", WideString(message.to_string())),
            ("Duration", UInt64(duration_secs)),
        ];

        Self {
            provider_id: EXTENSION_EVENT_PROVIDER.to_string(),
            event_id: EXTENSION_EVENT_ID,
            params: params
                .into_iter()
                .map(|(name, value)| Param {
                    name: name.to_string(),
                    value,
                })
                .collect(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Replace the value of an existing param. Returns false when absent.
    pub fn set_param(&mut self, name: &str, value: ParamValue) -> bool {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => {
                param.value = value;
                true
            }
            None => false,
        }
    }
}

/// Directory-backed FIFO of pending events.
#[derive(Debug, Clone)]
pub struct EventQueue {
    dir: PathBuf,
}

impl EventQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<(), EventError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    pub fn save(&self, event: &TelemetryEvent) -> Result<PathBuf, EventError> {
        self.ensure_dir()?;

        let queued = fs::read_dir(&self.dir)?.count();
        if queued > MAX_QUEUED_EVENTS {
            return Err(EventError::QueueFull(queued));
        }

        let payload = serde_json::to_vec(event)?;
        let mut stamp = Utc::now().timestamp_micros();
        loop {
            let tmp_path = self.dir.join(format!("{stamp}.tmp"));
            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    stamp += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = file.write_all(&payload) {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
            drop(file);

            // A hard link never replaces an existing record.
            let final_path = tmp_path.with_extension("tld");
            let published = fs::hard_link(&tmp_path, &final_path);
            fs::remove_file(&tmp_path)?;
            match published {
                Ok(()) => {
                    debug!(path = %final_path.display(), "Queued telemetry event");
                    return Ok(final_path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue an extension event, logging instead of failing.
    pub fn add_extension_event(
        &self,
        name: &str,
        op: Operation,
        success: bool,
        duration_secs: u64,
        version: &str,
        message: &str,
    ) {
        let event = TelemetryEvent::extension(name, op, success, duration_secs, version, message);
        if let Err(e) = self.save(&event) {
            warn!(extension = %name, operation = op.as_str(), error = %e, "Failed to queue telemetry event");
        }
    }

    /// Completed event files, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>, EventError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "tld"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Read and delete one record. The file is removed before parsing, so a
    /// record is consumed at most once even when it turns out malformed.
    pub fn take(&self, path: &Path) -> Result<TelemetryEvent, EventError> {
        let contents = fs::read(path)?;
        fs::remove_file(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}
