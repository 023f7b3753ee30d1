//! Lifecycle command execution.
//!
//! Commands come from the installed handler manifest and run through
//! `/bin/sh -c` in the manifest directory. Completion is polled on a fixed
//! interval; a command still running at the ceiling is killed along with its
//! whole process group and counts as failed. Every invocation queues a
//! telemetry event.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::children::ChildRegistry;
use crate::library::Library;
use crate::manifest::{HandlerManifest, LifecycleCommand, ManifestError};
use crate::plugin_log::PluginLog;
use crate::telemetry::{EventQueue, Operation};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no handler manifest under {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("handler manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("handler manifest has no {0}")]
    MissingCommand(&'static str),

    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command:?} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("{command:?} exited with {}", .code.map_or("signal".to_string(), |c| c.to_string()))]
    ExitStatus { command: String, code: Option<i32> },

    #[error("waiting on command: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

pub fn telemetry_operation(command: LifecycleCommand) -> Operation {
    match command {
        LifecycleCommand::Install => Operation::Install,
        LifecycleCommand::Uninstall => Operation::UnInstall,
        LifecycleCommand::Update => Operation::Upgrade,
        LifecycleCommand::Enable => Operation::Enable,
        LifecycleCommand::Disable => Operation::Disable,
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    library: Library,
    events: EventQueue,
    children: ChildRegistry,
    policy: CommandPolicy,
}

impl CommandRunner {
    pub fn new(
        library: Library,
        events: EventQueue,
        children: ChildRegistry,
        policy: CommandPolicy,
    ) -> Self {
        Self {
            library,
            events,
            children,
            policy,
        }
    }

    /// Run `command` for `name`-`version` and record the outcome.
    ///
    /// `previous` is the version being upgraded from; its install path is
    /// appended to the command line.
    pub async fn launch(
        &self,
        log: &PluginLog,
        name: &str,
        version: &str,
        command: LifecycleCommand,
        previous: Option<&str>,
    ) -> Result<(), CommandError> {
        let started = Instant::now();
        let handler_dir = self.library.handler_dir(name, version);
        let previous_dir = previous.map(|p| self.library.handler_dir(name, p));

        let result = self
            .run(&handler_dir, command, previous_dir.as_deref())
            .await;
        let elapsed = started.elapsed().as_secs();

        let message = match &result {
            Ok(()) => format!("{} succeeded", command.key()),
            Err(e) => format!("{} failed: {e}", command.key()),
        };
        log.log(&message);
        self.events.add_extension_event(
            name,
            telemetry_operation(command),
            result.is_ok(),
            elapsed,
            version,
            &message,
        );
        result
    }

    async fn run(
        &self,
        handler_dir: &Path,
        command: LifecycleCommand,
        previous_dir: Option<&Path>,
    ) -> Result<(), CommandError> {
        let manifest_path = Library::find_manifest(handler_dir)
            .ok_or_else(|| CommandError::ManifestNotFound(handler_dir.to_path_buf()))?;
        let manifest = HandlerManifest::load(&manifest_path)?;
        let entry = manifest
            .command(command)
            .ok_or(CommandError::MissingCommand(command.key()))?;

        let mut line = format!("{}/{}", manifest.dir.display(), entry);
        if let Some(previous) = previous_dir {
            line.push(' ');
            line.push_str(&previous.display().to_string());
        }
        info!(command = %line, "Launching lifecycle command");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&line)
            .current_dir(&manifest.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: line.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        self.children.register(pid, handler_dir.to_path_buf());

        let deadline = Instant::now() + self.policy.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    warn!(command = %line, pid, "Lifecycle command timed out, killing");
                    if let Ok(group) = i32::try_from(pid) {
                        if let Err(e) = killpg(Pid::from_raw(group), Signal::SIGKILL) {
                            warn!(pid, error = %e, "Failed to kill lifecycle process group");
                        }
                    }
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Failed to kill lifecycle command");
                    }
                    self.children.complete(pid);
                    return Err(CommandError::Timeout {
                        command: line,
                        timeout: self.policy.timeout,
                    });
                }
                Ok(None) => {
                    debug!(pid, "Lifecycle command still running");
                    tokio::time::sleep(self.policy.poll_interval).await;
                }
                Err(e) => {
                    self.children.complete(pid);
                    return Err(e.into());
                }
            }
        };
        self.children.complete(pid);

        if status.success() {
            Ok(())
        } else {
            Err(CommandError::ExitStatus {
                command: line,
                code: status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::HANDLER_MANIFEST_FILE;
    use crate::telemetry::event::ParamValue;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        lib: PathBuf,
        runner: CommandRunner,
        events: EventQueue,
        log: PluginLog,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let root = TempDir::new().unwrap();
        let lib = root.path().join("lib");
        fs::create_dir_all(&lib).unwrap();
        let events = EventQueue::new(lib.join("events"));
        let runner = CommandRunner::new(
            Library::new(&lib),
            events.clone(),
            ChildRegistry::new(),
            CommandPolicy {
                poll_interval: Duration::from_millis(20),
                timeout,
            },
        );
        let log = PluginLog::new(&root.path().join("log"), "Foo", "1.0");
        log.ensure_dir().unwrap();
        Fixture {
            _root: root,
            lib,
            runner,
            events,
            log,
        }
    }

    fn install_handler(lib: &Path, version: &str, scripts: &[(&str, &str)]) -> PathBuf {
        let dir = lib.join(format!("Foo-{version}"));
        fs::create_dir_all(&dir).unwrap();
        let mut commands = serde_json::Map::new();
        for (key, body) in scripts {
            let file = format!("{key}.sh");
            let path = dir.join(&file);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            commands.insert(key.to_string(), serde_json::Value::String(file));
        }
        let manifest = serde_json::json!([{ "handlerManifest": commands }]);
        fs::write(dir.join(HANDLER_MANIFEST_FILE), manifest.to_string()).unwrap();
        dir
    }

    fn last_event_success(events: &EventQueue) -> Option<ParamValue> {
        let pending = events.pending().unwrap();
        let event = events.take(pending.last()?).unwrap();
        event.param("OperationSuccess").cloned()
    }

    #[tokio::test]
    async fn successful_command_records_event() {
        let fx = fixture(Duration::from_secs(5));
        install_handler(&fx.lib, "1.0", &[("installCommand", "exit 0")]);

        fx.runner
            .launch(&fx.log, "Foo", "1.0", LifecycleCommand::Install, None)
            .await
            .unwrap();
        assert_eq!(last_event_success(&fx.events), Some(ParamValue::Bool(true)));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let fx = fixture(Duration::from_secs(5));
        install_handler(&fx.lib, "1.0", &[("enableCommand", "exit 3")]);

        let err = fx
            .runner
            .launch(&fx.log, "Foo", "1.0", LifecycleCommand::Enable, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ExitStatus { code: Some(3), .. }));
        assert_eq!(last_event_success(&fx.events), Some(ParamValue::Bool(false)));
    }

    #[tokio::test]
    async fn missing_command_key_does_not_spawn() {
        let fx = fixture(Duration::from_secs(5));
        install_handler(&fx.lib, "1.0", &[("installCommand", "exit 0")]);

        let err = fx
            .runner
            .launch(&fx.log, "Foo", "1.0", LifecycleCommand::Disable, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::MissingCommand("disableCommand")));
        assert!(fx.runner.children.is_empty());
    }

    #[tokio::test]
    async fn slow_command_is_killed_at_the_ceiling() {
        let fx = fixture(Duration::from_millis(200));
        install_handler(&fx.lib, "1.0", &[("enableCommand", "sleep 30")]);

        let started = Instant::now();
        let err = fx
            .runner
            .launch(&fx.log, "Foo", "1.0", LifecycleCommand::Enable, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(fx.runner.children.running().is_empty());
    }

    fn is_gone(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state == "Z" || state == "X"),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn timeout_kills_background_children() {
        let fx = fixture(Duration::from_millis(300));
        let pid_file = fx.lib.join("grandchild.pid");
        let script = format!("sleep 30 &\necho $! > {}\nwait", pid_file.display());
        install_handler(&fx.lib, "1.0", &[("enableCommand", script.as_str())]);

        let err = fx
            .runner
            .launch(&fx.log, "Foo", "1.0", LifecycleCommand::Enable, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));

        let grandchild = fs::read_to_string(&pid_file).unwrap();
        let grandchild = grandchild.trim();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_gone(grandchild) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(is_gone(grandchild), "background sleep {grandchild} survived the timeout");
    }

    #[tokio::test]
    async fn update_receives_previous_install_path() {
        let fx = fixture(Duration::from_secs(5));
        let out = fx.lib.join("update-args");
        let script = format!("echo \"$1\" > {}", out.display());
        let dir = install_handler(&fx.lib, "2.0", &[("updateCommand", script.as_str())]);

        fx.runner
            .launch(&fx.log, "Foo", "2.0", LifecycleCommand::Update, Some("1.0"))
            .await
            .unwrap();
        let arg = fs::read_to_string(&out).unwrap();
        assert_eq!(arg.trim(), fx.lib.join("Foo-1.0").display().to_string());
        assert!(dir.exists());
    }
}
