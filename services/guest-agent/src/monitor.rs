//! Environment monitor.
//!
//! Prunes finished extension processes from the child registry, warns about
//! long-running ones, and republishes the hostname over DHCP when it
//! changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::children::ChildRegistry;
use crate::context::AgentContext;
use crate::host::HostOps;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Children running longer than this are reported on every tick.
    pub long_running_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            long_running_after: Duration::from_secs(300),
        }
    }
}

/// What one monitor tick observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorTick {
    pub reaped: usize,
    pub republished: bool,
}

pub struct EnvMonitor {
    children: ChildRegistry,
    host: Arc<dyn HostOps>,
    monitor_hostname: bool,
    interface: String,
    config: MonitorConfig,
    last_hostname: Option<String>,
}

impl EnvMonitor {
    pub fn new(ctx: &AgentContext, config: MonitorConfig) -> Self {
        Self {
            children: ctx.children.clone(),
            host: ctx.host.clone(),
            monitor_hostname: ctx.config.monitor_hostname,
            interface: ctx.config.interface.clone(),
            config,
            last_hostname: None,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            monitor_hostname = self.monitor_hostname,
            "Starting environment monitor"
        );
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = self.tick().await;
                    if tick.reaped > 0 || tick.republished {
                        debug!(reaped = tick.reaped, republished = tick.republished, "Monitor tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Environment monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&mut self) -> MonitorTick {
        let reaped = self.children.reap().len();
        for child in self.children.running() {
            if child.running_for() >= self.config.long_running_after {
                warn!(
                    pid = child.pid,
                    handler_dir = %child.handler_dir.display(),
                    running_secs = child.running_for().as_secs(),
                    "Extension process still running"
                );
            }
        }

        let republished = self.monitor_hostname && self.check_hostname().await;
        MonitorTick { reaped, republished }
    }

    async fn check_hostname(&mut self) -> bool {
        let current = match self.host.hostname().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Unable to read hostname");
                return false;
            }
        };

        let changed = match &self.last_hostname {
            None => {
                self.last_hostname = Some(current);
                return false;
            }
            Some(last) => *last != current,
        };
        if !changed {
            return false;
        }

        info!(hostname = %current, interface = %self.interface, "Hostname changed, republishing");
        self.last_hostname = Some(current);
        match self.host.configure_interface(&self.interface).await {
            Ok(()) => true,
            Err(e) => {
                warn!(interface = %self.interface, error = %e, "Failed to restart interface");
                false
            }
        }
    }
}
