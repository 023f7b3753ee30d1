//! Host operating system operations.
//!
//! Everything the agent needs from the OS beyond files and processes goes
//! through [`HostOps`]. [`LinuxHost`] shells out to the standard tools.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run host command: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait HostOps: Send + Sync {
    async fn start_service(&self, name: &str) -> Result<(), HostError>;

    async fn stop_service(&self, name: &str) -> Result<(), HostError>;

    /// Create a local user; `expiration` is a `YYYY-MM-DD` account expiry.
    async fn create_user(&self, name: &str, expiration: Option<&str>) -> Result<(), HostError>;

    async fn delete_user(&self, name: &str) -> Result<(), HostError>;

    /// Bounce `interface` so DHCP republishes the hostname.
    async fn configure_interface(&self, interface: &str) -> Result<(), HostError>;

    async fn hostname(&self) -> Result<String, HostError>;
}

#[derive(Debug, Clone, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, HostError> {
        debug!(program, args = ?args, "Running host command");
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(HostError::Command {
                command: format!("{} {}", program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn start_service(&self, name: &str) -> Result<(), HostError> {
        self.run("systemctl", &["start", name]).await?;
        info!(service = name, "Started service");
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<(), HostError> {
        self.run("systemctl", &["stop", name]).await?;
        info!(service = name, "Stopped service");
        Ok(())
    }

    async fn create_user(&self, name: &str, expiration: Option<&str>) -> Result<(), HostError> {
        let mut args = vec!["-m", name];
        if let Some(expiration) = expiration {
            args.extend(["-e", expiration]);
        }
        self.run("useradd", &args).await?;
        info!(user = name, "Created user");
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), HostError> {
        self.run("userdel", &["-f", "-r", name]).await?;
        info!(user = name, "Deleted user");
        Ok(())
    }

    async fn configure_interface(&self, interface: &str) -> Result<(), HostError> {
        self.run("ip", &["link", "set", interface, "down"]).await?;
        self.run("ip", &["link", "set", interface, "up"]).await?;
        info!(interface, "Restarted interface");
        Ok(())
    }

    async fn hostname(&self) -> Result<String, HostError> {
        if let Ok(name) = tokio::fs::read_to_string("/proc/sys/kernel/hostname").await {
            return Ok(name.trim().to_string());
        }
        Ok(self.run("hostname", &[]).await?.trim().to_string())
    }
}
