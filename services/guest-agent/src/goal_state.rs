//! The extensions goal-state document.
//!
//! The document is deserialized into loosely typed raw structs and then
//! validated into [`GoalState`], so a missing or malformed field surfaces as
//! one [`GoalStateError`] naming it. A malformed top-level element fails the
//! whole document; a malformed `Plugin` entry is only set aside.

use serde::Deserialize;
use thiserror::Error;

use crate::manifest::HandlerManifest;

#[derive(Debug, Error)]
pub enum GoalStateError {
    #[error("malformed goal state document: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("goal state is missing {element}@{attribute}")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("invalid {attribute} {value:?} on {element}")]
    InvalidAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },

    #[error("invalid requested state {0:?}")]
    InvalidState(String),

    #[error("goal state has no StatusUploadBlob")]
    MissingStatusBlob,

    #[error("failed to persist goal state: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct RawExtensions {
    #[serde(rename = "@goalStateIncarnation")]
    incarnation: Option<String>,
    #[serde(rename = "Plugins")]
    plugins: Option<RawPlugins>,
    #[serde(rename = "PluginSettings")]
    plugin_settings: Option<RawPluginSettings>,
    #[serde(rename = "StatusUploadBlob")]
    status_upload_blob: Option<RawStatusBlob>,
}

#[derive(Debug, Deserialize)]
struct RawPlugins {
    #[serde(rename = "Plugin", default)]
    plugin: Vec<RawPlugin>,
}

#[derive(Debug, Deserialize)]
struct RawPlugin {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
    #[serde(rename = "@location")]
    location: Option<String>,
    #[serde(rename = "@failoverlocation")]
    failover_location: Option<String>,
    #[serde(rename = "@state")]
    state: Option<String>,
    #[serde(rename = "@autoUpgrade")]
    auto_upgrade: Option<String>,
    #[serde(rename = "@isJson")]
    is_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPluginSettings {
    #[serde(rename = "Plugin", default)]
    plugin: Vec<RawPluginSetting>,
}

#[derive(Debug, Deserialize)]
struct RawPluginSetting {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
    #[serde(rename = "RuntimeSettings", default)]
    runtime_settings: Vec<RawRuntimeSettings>,
}

#[derive(Debug, Deserialize)]
struct RawRuntimeSettings {
    #[serde(rename = "@seqNo")]
    seq_no: Option<String>,
    #[serde(rename = "$text", default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct RawStatusBlob {
    #[serde(rename = "@statusBlobType")]
    blob_type: Option<String>,
    #[serde(rename = "$text", default)]
    url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedState {
    Enabled,
    Disabled,
    Uninstall,
}

impl RequestedState {
    pub fn parse(value: &str) -> Result<Self, GoalStateError> {
        match value {
            "enabled" => Ok(RequestedState::Enabled),
            "disabled" => Ok(RequestedState::Disabled),
            "uninstall" => Ok(RequestedState::Uninstall),
            other => Err(GoalStateError::InvalidState(other.to_string())),
        }
    }
}

/// One desired extension, rebuilt every reconciliation pass.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub version: String,
    pub location: String,
    pub failover_location: Option<String>,
    pub state: RequestedState,
    pub auto_upgrade: bool,
    pub is_json: bool,
    /// Filled in once the installed handler manifest has been read.
    pub handler_manifest: Option<HandlerManifest>,
    /// Major-version upgrade refused; excluded from install and status.
    pub restricted: bool,
}

impl ExtensionDescriptor {
    pub fn has_location(&self) -> bool {
        !self.location.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub seq_no: u64,
    pub settings: String,
}

#[derive(Debug, Clone)]
struct PluginSettings {
    name: String,
    version: String,
    runtime: Option<RuntimeSettings>,
}

/// A `Plugin` entry dropped during validation. Only that extension is
/// skipped; the rest of the document is still reconciled.
#[derive(Debug)]
pub struct RejectedPlugin {
    pub name: Option<String>,
    pub version: Option<String>,
    pub error: GoalStateError,
}

#[derive(Debug)]
pub struct GoalState {
    pub incarnation: String,
    pub descriptors: Vec<ExtensionDescriptor>,
    pub rejected: Vec<RejectedPlugin>,
    settings: Vec<PluginSettings>,
    pub status_blob_type: Option<String>,
    status_upload_blob: Option<String>,
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn required(
    value: Option<String>,
    element: &'static str,
    attribute: &'static str,
) -> Result<String, GoalStateError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(GoalStateError::MissingAttribute { element, attribute })
}

impl GoalState {
    pub fn parse(xml: &str) -> Result<Self, GoalStateError> {
        let raw: RawExtensions = quick_xml::de::from_str(xml)?;
        let incarnation = required(raw.incarnation, "Extensions", "goalStateIncarnation")?;

        let mut rejected = Vec::new();

        let mut settings = Vec::new();
        for entry in raw.plugin_settings.map(|p| p.plugin).unwrap_or_default() {
            let (name, version) = (entry.name.clone(), entry.version.clone());
            match validate_settings(entry) {
                Ok(valid) => settings.push(valid),
                Err(error) => rejected.push(RejectedPlugin {
                    name,
                    version,
                    error,
                }),
            }
        }

        let mut descriptors = Vec::new();
        for entry in raw.plugins.map(|p| p.plugin).unwrap_or_default() {
            let (name, version) = (entry.name.clone(), entry.version.clone());
            match validate_plugin(entry) {
                // Unusable settings take their extension down with them.
                Ok(descriptor)
                    if rejected.iter().any(|r| {
                        r.name.as_deref() == Some(descriptor.name.as_str())
                            && r.version.as_deref() == Some(descriptor.version.as_str())
                    }) => {}
                Ok(descriptor) => descriptors.push(descriptor),
                Err(error) => rejected.push(RejectedPlugin {
                    name,
                    version,
                    error,
                }),
            }
        }

        let (status_blob_type, status_upload_blob) = match raw.status_upload_blob {
            Some(blob) => {
                // Some publishers double-escape the query separator.
                let url = blob.url.trim().replace("&amp;", "&");
                (blob.blob_type, (!url.is_empty()).then_some(url))
            }
            None => (None, None),
        };

        Ok(Self {
            incarnation,
            descriptors,
            rejected,
            settings,
            status_blob_type,
            status_upload_blob,
        })
    }

    /// Settings for `name`/`version`, or sequence 0 with an empty body.
    pub fn runtime_settings(&self, name: &str, version: &str) -> RuntimeSettings {
        self.settings
            .iter()
            .find(|s| s.name == name && s.version == version)
            .and_then(|s| s.runtime.clone())
            .unwrap_or_default()
    }

    pub fn status_upload_blob(&self) -> Result<&str, GoalStateError> {
        self.status_upload_blob
            .as_deref()
            .ok_or(GoalStateError::MissingStatusBlob)
    }
}

fn validate_plugin(raw: RawPlugin) -> Result<ExtensionDescriptor, GoalStateError> {
    let name = required(raw.name, "Plugin", "name")?;
    let version = required(raw.version, "Plugin", "version")?;
    let location = raw.location.unwrap_or_default().trim().to_string();

    // Entries without a location only carry settings and are never acted on.
    let state = match raw.state.as_deref().map(str::trim) {
        Some(state) if !state.is_empty() => RequestedState::parse(state)?,
        _ if location.is_empty() => RequestedState::Enabled,
        _ => {
            return Err(GoalStateError::MissingAttribute {
                element: "Plugin",
                attribute: "state",
            })
        }
    };

    Ok(ExtensionDescriptor {
        name,
        version,
        location,
        failover_location: raw
            .failover_location
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty()),
        state,
        auto_upgrade: parse_bool(raw.auto_upgrade.as_deref()),
        is_json: parse_bool(raw.is_json.as_deref()),
        handler_manifest: None,
        restricted: false,
    })
}

fn validate_settings(raw: RawPluginSetting) -> Result<PluginSettings, GoalStateError> {
    let name = required(raw.name, "PluginSettings/Plugin", "name")?;
    let version = required(raw.version, "PluginSettings/Plugin", "version")?;

    let runtime = match raw.runtime_settings.into_iter().next() {
        Some(settings) => {
            let seq_no = match settings.seq_no.as_deref().map(str::trim) {
                None | Some("") => 0,
                Some(value) => value.parse().map_err(|_| GoalStateError::InvalidAttribute {
                    element: "RuntimeSettings",
                    attribute: "seqNo",
                    value: value.to_string(),
                })?,
            };
            Some(RuntimeSettings {
                seq_no,
                settings: settings.body,
            })
        }
        None => None,
    };

    Ok(PluginSettings {
        name,
        version,
        runtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENSIONS_CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Extensions version="1.0.0.0" goalStateIncarnation="7">
  <GuestAgentExtension xmlns:i="http://www.w3.org/2001/XMLSchema-instance">
    <GAFamilies><GAFamily><Name>Prod</Name></GAFamily></GAFamilies>
  </GuestAgentExtension>
  <Plugins>
    <Plugin name="Foo" version="1.0" location="http://store/foo/manifest.xml" failoverlocation="http://mirror/foo/manifest.xml" autoUpgrade="false" runAsStartupTask="false" isJson="true" state="enabled" />
    <Plugin name="Bar" version="2.1" location="http://store/bar/manifest.xml" state="disabled" isJson="true" />
    <Plugin name="SettingsOnly" version="1.0" location="" />
  </Plugins>
  <PluginSettings>
    <Plugin name="Foo" version="1.0">
      <RuntimeSettings seqNo="3">{"runtimeSettings":[{"handlerSettings":{"publicSettings":{"a":1}}}]}</RuntimeSettings>
    </Plugin>
  </PluginSettings>
  <StatusUploadBlob statusBlobType="BlockBlob">https://store.blob/status?sv=1&amp;amp;sig=abc</StatusUploadBlob>
</Extensions>"#;

    #[test]
    fn parses_descriptors_and_settings() {
        let goal = GoalState::parse(EXTENSIONS_CONFIG).unwrap();
        assert_eq!(goal.incarnation, "7");
        assert_eq!(goal.descriptors.len(), 3);

        let foo = &goal.descriptors[0];
        assert_eq!(foo.name, "Foo");
        assert_eq!(foo.version, "1.0");
        assert_eq!(foo.state, RequestedState::Enabled);
        assert_eq!(
            foo.failover_location.as_deref(),
            Some("http://mirror/foo/manifest.xml")
        );
        assert!(foo.is_json);
        assert!(!foo.auto_upgrade);

        assert_eq!(goal.descriptors[1].state, RequestedState::Disabled);
        assert!(!goal.descriptors[2].has_location());

        let settings = goal.runtime_settings("Foo", "1.0");
        assert_eq!(settings.seq_no, 3);
        assert!(settings.settings.contains("publicSettings"));
        assert_eq!(goal.runtime_settings("Bar", "2.1"), RuntimeSettings::default());
    }

    #[test]
    fn status_blob_url_is_unescaped() {
        let goal = GoalState::parse(EXTENSIONS_CONFIG).unwrap();
        assert_eq!(
            goal.status_upload_blob().unwrap(),
            "https://store.blob/status?sv=1&sig=abc"
        );
        assert_eq!(goal.status_blob_type.as_deref(), Some("BlockBlob"));
    }

    #[test]
    fn missing_incarnation_is_rejected() {
        let err = GoalState::parse("<Extensions><Plugins/></Extensions>").unwrap_err();
        assert!(matches!(
            err,
            GoalStateError::MissingAttribute {
                attribute: "goalStateIncarnation",
                ..
            }
        ));
    }

    #[test]
    fn unknown_state_rejects_only_that_plugin() {
        let xml = r#"<Extensions goalStateIncarnation="1"><Plugins>
            <Plugin name="Foo" version="1.0" location="http://x/foo" state="enabled" isJson="true" />
            <Plugin name="Bar" version="1.0" location="http://x/bar" state="paused" isJson="true" />
        </Plugins></Extensions>"#;
        let goal = GoalState::parse(xml).unwrap();
        assert_eq!(goal.descriptors.len(), 1);
        assert_eq!(goal.descriptors[0].name, "Foo");
        assert_eq!(goal.rejected.len(), 1);
        assert_eq!(goal.rejected[0].name.as_deref(), Some("Bar"));
        assert!(matches!(&goal.rejected[0].error, GoalStateError::InvalidState(s) if s == "paused"));
    }

    #[test]
    fn plugin_without_name_is_rejected() {
        let xml = r#"<Extensions goalStateIncarnation="1"><Plugins>
            <Plugin version="1.0" location="http://x" state="enabled" />
            <Plugin name="Foo" version="1.0" location="http://x/foo" state="enabled" />
        </Plugins></Extensions>"#;
        let goal = GoalState::parse(xml).unwrap();
        assert_eq!(goal.descriptors.len(), 1);
        assert!(goal.rejected[0].name.is_none());
        assert!(matches!(
            goal.rejected[0].error,
            GoalStateError::MissingAttribute { attribute: "name", .. }
        ));
    }

    #[test]
    fn missing_status_blob_is_reported() {
        let goal = GoalState::parse(r#"<Extensions goalStateIncarnation="2"/>"#).unwrap();
        assert!(goal.descriptors.is_empty());
        assert!(matches!(
            goal.status_upload_blob(),
            Err(GoalStateError::MissingStatusBlob)
        ));
    }

    #[test]
    fn non_numeric_sequence_rejects_its_plugin() {
        let xml = r#"<Extensions goalStateIncarnation="1">
        <Plugins>
            <Plugin name="Foo" version="1.0" location="http://x/foo" state="enabled" />
            <Plugin name="Bar" version="1.0" location="http://x/bar" state="enabled" />
        </Plugins>
        <PluginSettings>
            <Plugin name="Foo" version="1.0"><RuntimeSettings seqNo="x">{}</RuntimeSettings></Plugin>
            <Plugin name="Bar" version="1.0"><RuntimeSettings seqNo="2">{}</RuntimeSettings></Plugin>
        </PluginSettings></Extensions>"#;
        let goal = GoalState::parse(xml).unwrap();
        assert_eq!(goal.descriptors.len(), 1);
        assert_eq!(goal.descriptors[0].name, "Bar");
        assert_eq!(goal.runtime_settings("Bar", "1.0").seq_no, 2);
        assert!(matches!(
            goal.rejected[0].error,
            GoalStateError::InvalidAttribute { attribute: "seqNo", .. }
        ));
    }
}
