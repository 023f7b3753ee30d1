//! Machine and deployment identity stamped onto outgoing events.
//!
//! Resolved once, lazily, from the host and from goal-state documents the
//! provisioning flow caches in the library directory. Anything that cannot
//! be resolved stays blank.

use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use super::event::{ParamValue, TelemetryEvent, GUEST_AGENT_VERSION};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemIdentity {
    pub os_version: String,
    pub ga_version: String,
    pub ram_mb: u64,
    pub processors: u64,
    pub tenant_name: String,
    pub role_name: String,
    pub role_instance_name: String,
    pub container_id: String,
}

impl SystemIdentity {
    pub fn resolve(lib_dir: &Path) -> Self {
        let mut identity = Self {
            os_version: os_version(),
            ga_version: GUEST_AGENT_VERSION.to_string(),
            ram_mb: total_ram_mb().unwrap_or(0),
            processors: std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(0),
            ..Self::default()
        };

        match fs::read_to_string(lib_dir.join("HostingEnvironmentConfig.xml")) {
            Ok(xml) => {
                identity.tenant_name = first_attribute(&xml, b"Deployment", b"name").unwrap_or_default();
                identity.role_name = first_attribute(&xml, b"Role", b"name").unwrap_or_default();
            }
            Err(e) => warn!(error = %e, "Unable to read HostingEnvironmentConfig.xml"),
        }

        match fs::read_to_string(lib_dir.join("SharedConfig.xml")) {
            Ok(xml) => {
                identity.role_instance_name =
                    first_attribute(&xml, b"Instance", b"id").unwrap_or_default();
            }
            Err(e) => warn!(error = %e, "Unable to read SharedConfig.xml"),
        }

        match newest_goal_state(lib_dir).and_then(|path| fs::read_to_string(path).ok()) {
            Some(xml) => identity.container_id = first_text(&xml, b"ContainerId").unwrap_or_default(),
            None => warn!(dir = %lib_dir.display(), "No cached GoalState document"),
        }

        debug!(identity = ?identity, "Resolved system identity");
        identity
    }

    fn values(&self) -> [(&'static str, ParamValue); 8] {
        use ParamValue::{UInt64, WideString};
        [
            ("OSVersion", WideString(self.os_version.clone())),
            ("GAVersion", WideString(self.ga_version.clone())),
            ("RAM", UInt64(self.ram_mb)),
            ("Processors", UInt64(self.processors)),
            ("TenantName", WideString(self.tenant_name.clone())),
            ("RoleName", WideString(self.role_name.clone())),
            ("RoleInstanceName", WideString(self.role_instance_name.clone())),
            ("ContainerId", WideString(self.container_id.clone())),
        ]
    }

    /// Fill identity params the event already declares.
    pub fn decorate(&self, event: &mut TelemetryEvent) {
        for (name, value) in self.values() {
            if !value.is_blank() {
                event.set_param(name, value);
            }
        }
    }
}

fn os_version() -> String {
    let distro = fs::read_to_string("/etc/os-release")
        .ok()
        .map(|contents| {
            let field = |key: &str| {
                contents.lines().find_map(|line| {
                    line.strip_prefix(key)
                        .and_then(|rest| rest.strip_prefix('='))
                        .map(|v| v.trim_matches('"').to_string())
                })
            };
            format!(
                "{}-{}",
                field("ID").unwrap_or_default(),
                field("VERSION_ID").unwrap_or_default()
            )
        })
        .unwrap_or_default();
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|r| r.trim().to_string())
        .unwrap_or_default();
    format!("Linux:{distro}:{release}")
}

fn total_ram_mb() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let kb: u64 = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kb / 1024)
}

fn newest_goal_state(lib_dir: &Path) -> Option<std::path::PathBuf> {
    fs::read_dir(lib_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("GoalState.") && name.ends_with(".xml")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn first_attribute(xml: &str, element: &[u8], attribute: &[u8]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == element => {
                let attr = e.try_get_attribute(attribute).ok()??;
                return attr.unescape_value().ok().map(|v| v.into_owned());
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

fn first_text(xml: &str, element: &[u8]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.local_name().as_ref() == element => inside = true,
            Event::Text(t) if inside => return t.unescape().ok().map(|v| v.into_owned()),
            Event::End(_) if inside => return None,
            Event::Eof => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::Operation;
    use tempfile::TempDir;

    #[test]
    fn reads_cached_deployment_documents() {
        let lib = TempDir::new().unwrap();
        fs::write(
            lib.path().join("HostingEnvironmentConfig.xml"),
            r#"<HostingEnvironmentConfig><Deployment name="dep-1" guid="{x}" /><Role guid="{y}" name="web" /></HostingEnvironmentConfig>"#,
        )
        .unwrap();
        fs::write(
            lib.path().join("SharedConfig.xml"),
            r#"<SharedConfig><Instances><Instance id="web_IN_0" address="10.0.0.4"/></Instances></SharedConfig>"#,
        )
        .unwrap();
        fs::write(
            lib.path().join("GoalState.3.xml"),
            "<GoalState><Container><ContainerId>c-42</ContainerId></Container></GoalState>",
        )
        .unwrap();

        let identity = SystemIdentity::resolve(lib.path());
        assert_eq!(identity.tenant_name, "dep-1");
        assert_eq!(identity.role_name, "web");
        assert_eq!(identity.role_instance_name, "web_IN_0");
        assert_eq!(identity.container_id, "c-42");
        assert_eq!(identity.ga_version, GUEST_AGENT_VERSION);
    }

    #[test]
    fn missing_documents_leave_fields_blank() {
        let lib = TempDir::new().unwrap();
        let identity = SystemIdentity::resolve(lib.path());
        assert!(identity.tenant_name.is_empty());
        assert!(identity.container_id.is_empty());
    }

    #[test]
    fn decorate_fills_declared_fields() {
        let identity = SystemIdentity {
            tenant_name: "dep-1".to_string(),
            ram_mb: 2048,
            ..SystemIdentity::default()
        };
        let mut event = TelemetryEvent::extension("Foo", Operation::Enable, true, 1, "1.0", "");
        identity.decorate(&mut event);
        assert_eq!(
            event.param("TenantName"),
            Some(&ParamValue::WideString("dep-1".to_string()))
        );
        assert_eq!(event.param("RAM"), Some(&ParamValue::UInt64(2048)));
        assert_eq!(
            event.param("RoleName"),
            Some(&ParamValue::WideString(String::new()))
        );
    }
}
