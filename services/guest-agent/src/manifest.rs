//! Extension manifests.
//!
//! Two documents describe an extension: the plugin manifest downloaded
//! from the goal-state location (XML, lists bundle URIs per version) and the
//! handler manifest shipped inside the bundle (`HandlerManifest.json`, maps
//! lifecycle steps to commands).

use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed plugin manifest: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed handler manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handler manifest has no handlerManifest section")]
    MissingHandlerManifest,

    #[error("handler manifest not found under {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle steps an extension exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Install,
    Uninstall,
    Update,
    Enable,
    Disable,
}

impl LifecycleCommand {
    /// Key in the `handlerManifest` table.
    pub fn key(&self) -> &'static str {
        match self {
            LifecycleCommand::Install => "installCommand",
            LifecycleCommand::Uninstall => "uninstallCommand",
            LifecycleCommand::Update => "updateCommand",
            LifecycleCommand::Enable => "enableCommand",
            LifecycleCommand::Disable => "disableCommand",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerCommands {
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub uninstall_command: Option<String>,
    #[serde(default)]
    pub update_command: Option<String>,
    #[serde(default)]
    pub enable_command: Option<String>,
    #[serde(default)]
    pub disable_command: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub report_heartbeat: bool,
}

/// Handlers ship flags both as JSON booleans and as `"true"`/`"false"`.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(value)) => value,
        Some(Flag::Text(value)) => value.trim().eq_ignore_ascii_case("true"),
        None => false,
    })
}

/// A parsed `HandlerManifest.json` and the directory it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerManifest {
    pub dir: PathBuf,
    pub commands: HandlerCommands,
}

impl HandlerManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)?;
        let dir = path
            .parent()
            .ok_or_else(|| ManifestError::NotFound(path.to_path_buf()))?;
        Self::parse(&contents, dir)
    }

    /// Accepts either a bare object or a one-element array of it.
    pub fn parse(contents: &str, dir: &Path) -> Result<Self, ManifestError> {
        let value: serde_json::Value = serde_json::from_str(contents)?;
        let root = match value {
            serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        let section = root
            .get("handlerManifest")
            .cloned()
            .ok_or(ManifestError::MissingHandlerManifest)?;
        let commands = serde_json::from_value(section)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            commands,
        })
    }

    pub fn command(&self, command: LifecycleCommand) -> Option<&str> {
        let value = match command {
            LifecycleCommand::Install => &self.commands.install_command,
            LifecycleCommand::Uninstall => &self.commands.uninstall_command,
            LifecycleCommand::Update => &self.commands.update_command,
            LifecycleCommand::Enable => &self.commands.enable_command,
            LifecycleCommand::Disable => &self.commands.disable_command,
        };
        value.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn reports_heartbeat(&self) -> bool {
        self.commands.report_heartbeat
    }
}

/// One `Plugin` entry of a downloaded plugin manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginVersion {
    pub version: String,
    pub uri: Option<String>,
    pub disallow_major_upgrade: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginManifest {
    pub versions: Vec<PluginVersion>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Version,
    Uri,
    DisallowMajor,
}

impl PluginManifest {
    /// Collect every `Plugin` element at any depth.
    pub fn parse(xml: &str) -> Result<Self, ManifestError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut versions = Vec::new();
        let mut current: Option<PluginVersion> = None;
        let mut field: Option<Field> = None;
        let mut text = String::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"Plugin" => current = Some(PluginVersion::default()),
                    b"Version" => field = Some(Field::Version),
                    b"Uri" => field = Some(Field::Uri),
                    b"DisallowMajorVersionUpgrade" => field = Some(Field::DisallowMajor),
                    _ => {}
                },
                Event::Text(t) if field.is_some() => text.push_str(&t.unescape()?),
                Event::CData(c) if field.is_some() => {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()))
                }
                Event::End(e) => {
                    let name = e.local_name();
                    if name.as_ref() == b"Plugin" {
                        versions.extend(current.take());
                    } else if let (Some(f), Some(plugin)) = (field, current.as_mut()) {
                        let value = std::mem::take(&mut text);
                        let value = value.trim();
                        match f {
                            Field::Version => plugin.version = value.to_string(),
                            // Only the first listed mirror is used.
                            Field::Uri if plugin.uri.is_none() && !value.is_empty() => {
                                plugin.uri = Some(value.to_string())
                            }
                            Field::Uri => {}
                            Field::DisallowMajor => {
                                plugin.disallow_major_upgrade = value.eq_ignore_ascii_case("true")
                            }
                        }
                    }
                    field = None;
                    text.clear();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { versions })
    }

    pub fn version(&self, version: &str) -> Option<&PluginVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Drop a leading UTF-8 byte-order mark.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLUGIN_MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<PluginVersionManifest>
  <Plugins>
    <Plugin>
      <Version>1.0</Version>
      <Uris><Uri>http://store/foo-1.0.zip</Uri><Uri>http://mirror/foo-1.0.zip</Uri></Uris>
    </Plugin>
    <Plugin>
      <Version>2.0</Version>
      <Uris><Uri>http://store/foo-2.0.zip?sv=1&amp;sig=x</Uri></Uris>
      <DisallowMajorVersionUpgrade>true</DisallowMajorVersionUpgrade>
    </Plugin>
  </Plugins>
</PluginVersionManifest>"#;

    #[test]
    fn plugin_manifest_lists_versions() {
        let manifest = PluginManifest::parse(PLUGIN_MANIFEST).unwrap();
        assert_eq!(manifest.versions.len(), 2);

        let v1 = manifest.version("1.0").unwrap();
        assert_eq!(v1.uri.as_deref(), Some("http://store/foo-1.0.zip"));
        assert!(!v1.disallow_major_upgrade);

        let v2 = manifest.version("2.0").unwrap();
        assert_eq!(v2.uri.as_deref(), Some("http://store/foo-2.0.zip?sv=1&sig=x"));
        assert!(v2.disallow_major_upgrade);

        assert!(manifest.version("3.0").is_none());
    }

    #[test]
    fn bom_is_stripped() {
        let with_bom = [b"\xEF\xBB\xBF".as_slice(), PLUGIN_MANIFEST.as_bytes()].concat();
        let stripped = strip_bom(&with_bom);
        assert!(stripped.starts_with(b"<?xml"));
        assert_eq!(strip_bom(b"plain"), b"plain");
    }

    #[test]
    fn malformed_plugin_manifest_is_an_error() {
        assert!(PluginManifest::parse("<Plugin><Version>1.0</Plugin>").is_err());
    }

    #[test]
    fn handler_manifest_accepts_array_form() {
        let json = r#"[{"version": 1.0, "handlerManifest": {
            "installCommand": "install.sh",
            "enableCommand": "enable.sh",
            "disableCommand": " ",
            "reportHeartbeat": true
        }}]"#;
        let manifest = HandlerManifest::parse(json, Path::new("/lib/Foo-1.0")).unwrap();
        assert_eq!(manifest.command(LifecycleCommand::Install), Some("install.sh"));
        assert_eq!(manifest.command(LifecycleCommand::Disable), None);
        assert_eq!(manifest.command(LifecycleCommand::Update), None);
        assert!(manifest.reports_heartbeat());
        assert_eq!(manifest.dir, PathBuf::from("/lib/Foo-1.0"));
    }

    #[test]
    fn handler_manifest_accepts_object_form() {
        let json = r#"{"handlerManifest": {"enableCommand": "run.sh enable"}}"#;
        let manifest = HandlerManifest::parse(json, Path::new("/x")).unwrap();
        assert_eq!(manifest.command(LifecycleCommand::Enable), Some("run.sh enable"));
        assert!(!manifest.reports_heartbeat());
    }

    #[rstest::rstest]
    #[case(r#"true"#, true)]
    #[case(r#"false"#, false)]
    #[case(r#""true""#, true)]
    #[case(r#""True""#, true)]
    #[case(r#""false""#, false)]
    #[case(r#"null"#, false)]
    fn report_heartbeat_accepts_bool_or_string(#[case] raw: &str, #[case] expected: bool) {
        let contents = format!(
            r#"[{{"handlerManifest":{{"enableCommand":"enable.sh","reportHeartbeat":{raw}}}}}]"#
        );
        let manifest = HandlerManifest::parse(&contents, Path::new("/ext")).unwrap();
        assert_eq!(manifest.reports_heartbeat(), expected);
        assert_eq!(manifest.command(LifecycleCommand::Enable), Some("enable.sh"));
    }

    #[test]
    fn handler_manifest_without_section_is_rejected() {
        let err = HandlerManifest::parse(r#"[{"name": "Foo"}]"#, Path::new("/x")).unwrap_err();
        assert!(matches!(err, ManifestError::MissingHandlerManifest));
    }
}
