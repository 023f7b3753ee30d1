//! Aggregate status reporting.
//!
//! Extensions report their own state by writing `status/<seq>.status` and,
//! optionally, a `heartbeat.log` they refresh periodically. The aggregator
//! merges those with the persisted handler state into one document per
//! report and uploads it to the goal state's status blob.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vmagent_wire::{BlobClient, BlobError};

use crate::context::{AgentContext, AgentState};
use crate::goal_state::{ExtensionDescriptor, GoalState, RequestedState};
use crate::handler_state::{self, HandlerState};
use crate::library::Library;
use crate::manifest::HandlerManifest;
use crate::telemetry::event::GUEST_AGENT_VERSION;

/// A heartbeat older than this marks the extension unresponsive.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(600);
pub const HEARTBEAT_FILE: &str = "heartbeat.log";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("goal state has no status upload blob")]
    MissingStatusBlob,

    #[error("status upload failed: {0}")]
    Upload(#[from] BlobError),

    #[error("failed to serialize status: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettingsStatus {
    pub sequence_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_status: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerAggregateStatus {
    pub handler_name: String,
    pub handler_version: String,
    pub status: String,
    pub runtime_settings_status: RuntimeSettingsStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatusDocument {
    pub version: &'static str,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: String,
    pub aggregate_status: AggregateStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    pub guest_agent_status: GuestAgentStatus,
    pub handler_aggregate_status: Vec<HandlerAggregateStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestAgentStatus {
    pub version: String,
    pub status: String,
    pub formatted_message: FormattedMessage,
}

#[derive(Debug, Serialize)]
pub struct FormattedMessage {
    pub lang: String,
    pub message: String,
}

/// Status label implied by the persisted handler state alone.
pub fn base_status(state: HandlerState) -> &'static str {
    match state {
        HandlerState::Installed => "Installing",
        HandlerState::Enabled => "Ready",
        HandlerState::NotInstalled | HandlerState::Disabled => "NotReady",
    }
}

/// Highest `<n>.<ext>` file number under `config/`, or 0.
pub fn current_sequence_number(extension_dir: &Path) -> u64 {
    walkdir::WalkDir::new(extension_dir.join("config"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .split('.')
                .next()?
                .parse::<u64>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}

fn first_element(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Array(mut items)) if !items.is_empty() => Some(items.swap_remove(0)),
        Ok(_) => None,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Malformed extension status document");
            None
        }
    }
}

/// Merge one extension's persisted state, status and heartbeat.
pub fn handler_aggregate_status(
    extension_dir: &Path,
    name: &str,
    version: &str,
    report_heartbeat: bool,
    now: SystemTime,
) -> HandlerAggregateStatus {
    let seq = current_sequence_number(extension_dir);
    let mut aggregate = HandlerAggregateStatus {
        handler_name: name.to_string(),
        handler_version: version.to_string(),
        status: base_status(handler_state::get_state(extension_dir)).to_string(),
        runtime_settings_status: RuntimeSettingsStatus {
            sequence_number: seq.to_string(),
            settings_status: None,
        },
        code: None,
        formatted_message: None,
        message: None,
    };

    if report_heartbeat {
        let heartbeat_path = extension_dir.join(HEARTBEAT_FILE);
        let age = std::fs::metadata(&heartbeat_path)
            .and_then(|m| m.modified())
            .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO));
        match age {
            Ok(age) if age <= HEARTBEAT_STALE_AFTER => {
                match first_element(&heartbeat_path).and_then(|v| v.get("heartbeat").cloned()) {
                    Some(heartbeat) => {
                        if let Some(status) = heartbeat.get("status").and_then(Value::as_str) {
                            aggregate.status = status.to_string();
                        }
                        aggregate.code = heartbeat.get("code").filter(|v| !v.is_null()).cloned();
                        aggregate.formatted_message =
                            heartbeat.get("formattedMessage").filter(|v| truthy(v)).cloned();
                        aggregate.message = heartbeat.get("message").filter(|v| truthy(v)).cloned();
                    }
                    None => warn!(extension = %name, "Ignoring malformed heartbeat file"),
                }
            }
            _ => aggregate.status = "Unresponsive".to_string(),
        }
    }

    let status_path = extension_dir.join("status").join(format!("{seq}.status"));
    if let Some(Value::Object(mut status)) = first_element(&status_path) {
        status.remove("version");
        if !status.is_empty() {
            aggregate.runtime_settings_status.settings_status = Some(Value::Object(status));
        }
    }

    debug!(extension = %name, version = %version, status = %aggregate.status, "Handler aggregate status");
    aggregate
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

pub fn aggregate_document(
    agent: &AgentState,
    handlers: Vec<HandlerAggregateStatus>,
) -> AggregateStatusDocument {
    AggregateStatusDocument {
        version: "1.0",
        timestamp_utc: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        aggregate_status: AggregateStatus {
            guest_agent_status: GuestAgentStatus {
                version: GUEST_AGENT_VERSION.to_string(),
                status: agent.label().to_string(),
                formatted_message: FormattedMessage {
                    lang: "en-US".to_string(),
                    message: agent.message().to_string(),
                },
            },
            handler_aggregate_status: handlers,
        },
    }
}

/// Descriptors that take part in status reporting.
pub fn reportable(descriptor: &ExtensionDescriptor) -> bool {
    descriptor.has_location()
        && descriptor.is_json
        && !descriptor.restricted
        && descriptor.state != RequestedState::Uninstall
}

fn extension_dir(library: &Library, descriptor: &ExtensionDescriptor) -> PathBuf {
    let handler_dir = library.handler_dir(&descriptor.name, &descriptor.version);
    Library::find_manifest_dir(&handler_dir).unwrap_or(handler_dir)
}

fn reports_heartbeat(extension_dir: &Path, descriptor: &ExtensionDescriptor) -> bool {
    if let Some(manifest) = &descriptor.handler_manifest {
        return manifest.reports_heartbeat();
    }
    match Library::find_manifest(extension_dir).map(|path| HandlerManifest::load(&path)) {
        Some(Ok(manifest)) => manifest.reports_heartbeat(),
        Some(Err(e)) => {
            error!(extension = %descriptor.name, error = %e, "Failed to read handler manifest");
            false
        }
        None => {
            error!(extension = %descriptor.name, "Failed to get handler manifest");
            false
        }
    }
}

/// Build the aggregate status for `descriptors`.
pub fn build(
    ctx: &AgentContext,
    agent: &AgentState,
    descriptors: &[ExtensionDescriptor],
) -> AggregateStatusDocument {
    let now = SystemTime::now();
    let handlers = descriptors
        .iter()
        .filter(|d| reportable(d))
        .map(|d| {
            let dir = extension_dir(&ctx.library, d);
            handler_aggregate_status(&dir, &d.name, &d.version, reports_heartbeat(&dir, d), now)
        })
        .collect();
    aggregate_document(agent, handlers)
}

/// Build the aggregate status and upload it to the goal state's blob.
pub async fn build_and_upload(
    ctx: &AgentContext,
    goal_state: &GoalState,
    descriptors: &[ExtensionDescriptor],
    agent: &AgentState,
) -> Result<(), StatusError> {
    let document = build(ctx, agent, descriptors);
    let payload = serde_json::to_vec(&document)?;

    let url = goal_state.status_upload_blob().map_err(|e| {
        error!(error = %e, "Unable to send status reports");
        StatusError::MissingStatusBlob
    })?;

    debug!(url = %url, len = payload.len(), "Sending status report");
    BlobClient::new(ctx.transport.clone())
        .upload(url, &payload)
        .await?;
    info!(
        handlers = document.aggregate_status.handler_aggregate_status.len(),
        agent_status = agent.label(),
        "Status report uploaded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::HANDLER_MANIFEST_FILE;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    fn extension() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(HANDLER_MANIFEST_FILE), b"[]").unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::create_dir_all(dir.path().join("status")).unwrap();
        dir
    }

    #[rstest]
    #[case(HandlerState::Installed, "Installing")]
    #[case(HandlerState::Enabled, "Ready")]
    #[case(HandlerState::NotInstalled, "NotReady")]
    #[case(HandlerState::Disabled, "NotReady")]
    fn base_status_mapping(#[case] state: HandlerState, #[case] expected: &str) {
        assert_eq!(base_status(state), expected);
    }

    #[test]
    fn sequence_number_is_highest_settings_file() {
        let dir = extension();
        for file in ["0.settings", "4.settings", "12.settings", "HandlerState"] {
            fs::write(dir.path().join("config").join(file), b"").unwrap();
        }
        assert_eq!(current_sequence_number(dir.path()), 12);
        assert_eq!(current_sequence_number(Path::new("/nonexistent")), 0);
    }

    #[test]
    fn status_document_merges_settings_status() {
        let dir = extension();
        handler_state::set_state(dir.path(), HandlerState::Enabled).unwrap();
        fs::write(dir.path().join("config/2.settings"), b"{}").unwrap();
        fs::write(
            dir.path().join("status/2.status"),
            r#"[{"version": 1.0, "timestampUTC": "2026-01-01T00:00:00Z", "status": {"status": "success"}}]"#,
        )
        .unwrap();

        let agg = handler_aggregate_status(dir.path(), "Foo", "1.0", false, SystemTime::now());
        assert_eq!(agg.status, "Ready");
        assert_eq!(agg.runtime_settings_status.sequence_number, "2");
        let settings = agg.runtime_settings_status.settings_status.unwrap();
        assert!(settings.get("version").is_none());
        assert_eq!(settings["status"]["status"], "success");
    }

    #[test]
    fn fresh_heartbeat_overrides_status() {
        let dir = extension();
        handler_state::set_state(dir.path(), HandlerState::Enabled).unwrap();
        fs::write(
            dir.path().join(HEARTBEAT_FILE),
            r#"[{"version": 1.0, "heartbeat": {"status": "NotReady", "code": 5, "formattedMessage": {"lang": "en-US", "message": "busy"}, "message": ""}}]"#,
        )
        .unwrap();

        let agg = handler_aggregate_status(dir.path(), "Foo", "1.0", true, SystemTime::now());
        assert_eq!(agg.status, "NotReady");
        assert_eq!(agg.code, Some(serde_json::json!(5)));
        assert!(agg.formatted_message.is_some());
        assert!(agg.message.is_none());
    }

    #[test]
    fn stale_heartbeat_is_unresponsive() {
        let dir = extension();
        fs::write(
            dir.path().join(HEARTBEAT_FILE),
            r#"[{"heartbeat": {"status": "Ready"}}]"#,
        )
        .unwrap();

        let later = SystemTime::now() + Duration::from_secs(601);
        let agg = handler_aggregate_status(dir.path(), "Foo", "1.0", true, later);
        assert_eq!(agg.status, "Unresponsive");
    }

    #[test]
    fn missing_heartbeat_is_unresponsive_only_when_expected() {
        let dir = extension();
        handler_state::set_state(dir.path(), HandlerState::Installed).unwrap();
        let now = SystemTime::now();
        assert_eq!(
            handler_aggregate_status(dir.path(), "Foo", "1.0", true, now).status,
            "Unresponsive"
        );
        assert_eq!(
            handler_aggregate_status(dir.path(), "Foo", "1.0", false, now).status,
            "Installing"
        );
    }

    #[test]
    fn document_shape() {
        let handler = handler_aggregate_status(
            Path::new("/nonexistent"),
            "Foo",
            "1.0",
            false,
            SystemTime::now(),
        );
        let doc = serde_json::to_value(aggregate_document(&AgentState::Ready, vec![handler])).unwrap();
        assert_eq!(doc["version"], "1.0");
        assert!(doc["timestampUTC"].as_str().unwrap().ends_with('Z'));
        let agent = &doc["aggregateStatus"]["guestAgentStatus"];
        assert_eq!(agent["version"], GUEST_AGENT_VERSION);
        assert_eq!(agent["status"], "Ready");
        assert_eq!(agent["formattedMessage"]["lang"], "en-US");
        let handler = &doc["aggregateStatus"]["handlerAggregateStatus"][0];
        assert_eq!(handler["handlerName"], "Foo");
        assert_eq!(handler["status"], "NotReady");
        assert_eq!(handler["runtimeSettingsStatus"]["sequenceNumber"], "0");
        assert!(handler.get("code").is_none());
    }
}
