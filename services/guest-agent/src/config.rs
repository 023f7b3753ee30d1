//! Configuration for the guest agent.
//!
//! Values come from `VMAGENT_*` environment variables, falling back to an
//! optional `waagent.conf` style file (named by `VMAGENT_CONF`), falling back
//! to built-in defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use vmagent_wire::ProxyConfig;

/// Guest agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the extension library (`<name>-<version>` directories,
    /// cached goal-state documents, the event queue).
    pub lib_dir: PathBuf,

    /// Root of the per-extension log directories.
    pub extension_log_dir: PathBuf,

    /// Wire server base URL for relative requests such as telemetry.
    pub endpoint: String,

    /// Proxy used for manifest, bundle and status blob traffic.
    pub http_proxy: Option<ProxyConfig>,

    /// Republish the hostname when it changes.
    pub monitor_hostname: bool,

    /// Interface restarted to republish the hostname.
    pub interface: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Parsed `Key=Value` configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    values: HashMap<String, String>,
}

impl ConfFile {
    pub fn parse(contents: &str) -> Self {
        let values = contents
            .lines()
            .filter_map(|line| {
                let line = line.split('#').next().unwrap_or("").trim();
                let (key, value) = line.split_once('=')?;
                let (key, value) = (key.trim(), value.trim());
                if key.is_empty() || value.is_empty() || value == "None" {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self { values }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl Config {
    /// Load configuration from environment variables and the optional
    /// config file.
    pub fn from_env() -> Result<Self> {
        let conf = match std::env::var("VMAGENT_CONF") {
            Ok(path) => ConfFile::load(Path::new(&path))?,
            Err(_) => ConfFile::default(),
        };
        Self::from_sources(&conf, |key| std::env::var(key).ok())
    }

    /// Resolve every setting from `env` first, then `conf`.
    pub fn from_sources(conf: &ConfFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |env_key: &str, conf_key: &str| {
            env(env_key).or_else(|| conf.get(conf_key).map(str::to_string))
        };

        let lib_dir = lookup("VMAGENT_LIB_DIR", "Lib.Dir")
            .unwrap_or_else(|| "/var/lib/waagent".to_string());

        let extension_log_dir = lookup("VMAGENT_EXTENSION_LOG_DIR", "Logs.ExtensionDir")
            .unwrap_or_else(|| "/var/log/azure".to_string());

        let endpoint = lookup("VMAGENT_ENDPOINT", "Endpoint")
            .unwrap_or_else(|| "http://168.63.129.16".to_string());

        let http_proxy = match (
            lookup("VMAGENT_HTTP_PROXY_HOST", "HttpProxy.Host"),
            lookup("VMAGENT_HTTP_PROXY_PORT", "HttpProxy.Port"),
        ) {
            (Some(host), Some(port)) => Some(ProxyConfig {
                host,
                port: port
                    .parse()
                    .with_context(|| format!("invalid proxy port {port:?}"))?,
            }),
            _ => None,
        };

        let monitor_hostname = lookup("VMAGENT_MONITOR_HOSTNAME", "Provisioning.MonitorHostName")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let interface =
            lookup("VMAGENT_INTERFACE", "Network.Interface").unwrap_or_else(|| "eth0".to_string());

        let log_level =
            lookup("VMAGENT_LOG_LEVEL", "Logs.Level").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            lib_dir: PathBuf::from(lib_dir),
            extension_log_dir: PathBuf::from(extension_log_dir),
            endpoint,
            http_proxy,
            monitor_hostname,
            interface,
            log_level,
        })
    }

    /// Defaults rooted at the given directories, for tests and tools.
    pub fn with_dirs(lib_dir: impl Into<PathBuf>, extension_log_dir: impl Into<PathBuf>) -> Self {
        Self {
            lib_dir: lib_dir.into(),
            extension_log_dir: extension_log_dir.into(),
            endpoint: "http://168.63.129.16".to_string(),
            http_proxy: None,
            monitor_hostname: false,
            interface: "eth0".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "y" | "yes" | "true" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_file_strips_comments_and_none() {
        let conf = ConfFile::parse(
            "# comment\nLib.Dir=/srv/agent # trailing\nHttpProxy.Host=None\n\nbad line\n",
        );
        assert_eq!(conf.get("Lib.Dir"), Some("/srv/agent"));
        assert_eq!(conf.get("HttpProxy.Host"), None);
        assert_eq!(conf.get("bad line"), None);
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config = Config::from_sources(&ConfFile::default(), |_| None).unwrap();
        assert_eq!(config.lib_dir, PathBuf::from("/var/lib/waagent"));
        assert_eq!(config.extension_log_dir, PathBuf::from("/var/log/azure"));
        assert_eq!(config.endpoint, "http://168.63.129.16");
        assert!(config.http_proxy.is_none());
        assert!(!config.monitor_hostname);
        assert_eq!(config.interface, "eth0");
    }

    #[test]
    fn env_overrides_file() {
        let conf = ConfFile::parse(
            "Lib.Dir=/from/file\nHttpProxy.Host=proxy.local\nHttpProxy.Port=3128\nProvisioning.MonitorHostName=y\n",
        );
        let config = Config::from_sources(&conf, |key| match key {
            "VMAGENT_LIB_DIR" => Some("/from/env".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.lib_dir, PathBuf::from("/from/env"));
        assert_eq!(
            config.http_proxy,
            Some(ProxyConfig {
                host: "proxy.local".to_string(),
                port: 3128
            })
        );
        assert!(config.monitor_hostname);
    }

    #[test]
    fn invalid_proxy_port_is_an_error() {
        let conf = ConfFile::parse("HttpProxy.Host=proxy\nHttpProxy.Port=abc\n");
        assert!(Config::from_sources(&conf, |_| None).is_err());
    }
}
