//! Extension reconciliation.
//!
//! The reconciler converges the extension library onto a goal-state
//! document:
//! - disabled/uninstall descriptors are disabled (and removed)
//! - enabled descriptors newer than anything installed are downloaded,
//!   unpacked and installed, or upgraded from the previous version
//! - every enabled descriptor gets its current runtime settings and an
//!   enable
//!
//! One descriptor failing never stops the others. The handler-state marker
//! is updated after every lifecycle command.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use vmagent_wire::TransportError;
use walkdir::WalkDir;

use crate::command::CommandRunner;
use crate::context::AgentContext;
use crate::goal_state::{ExtensionDescriptor, GoalState, GoalStateError, RequestedState};
use crate::handler_state::{self, HandlerState};
use crate::library::{InstalledVersion, Library, LooseVersion};
use crate::manifest::{strip_bom, HandlerManifest, LifecycleCommand, ManifestError, PluginManifest};
use crate::plugin_log::PluginLog;
use crate::status::HEARTBEAT_FILE;
use crate::telemetry::Operation;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("not a JSON extension")]
    NotJson,

    #[error("handler manifest not found under {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("plugin manifest could not be downloaded from any location")]
    ManifestDownload,

    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("no bundle uri for version {0}")]
    MissingBundleUri(String),

    #[error("bundle download failed: {0}")]
    BundleDownload(#[source] TransportError),

    #[error("bundle unpack failed: {0}")]
    Unpack(#[from] zip::result::ZipError),

    #[error("unpack task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub incarnation: String,
    /// Every descriptor of the goal state, with restricted flags and
    /// handler manifests filled in by processing.
    pub descriptors: Vec<ExtensionDescriptor>,
}

enum Flow {
    Continue,
    Restricted,
}

pub struct Reconciler<'a> {
    ctx: &'a AgentContext,
    runner: CommandRunner,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: &'a AgentContext) -> Self {
        Self {
            ctx,
            runner: ctx.command_runner(),
        }
    }

    fn library(&self) -> &Library {
        &self.ctx.library
    }

    /// Parse and persist `xml`, then reconcile it.
    pub async fn reconcile_document(
        &self,
        xml: &str,
    ) -> Result<(GoalState, ReconcileOutcome), GoalStateError> {
        let goal = GoalState::parse(xml).inspect_err(|e| {
            error!(error = %e, "Error parsing extensions config");
        })?;

        let lib = self.library().root();
        fs::create_dir_all(lib)?;
        fs::write(
            lib.join(format!("ExtensionsConfig.{}.xml", goal.incarnation)),
            xml,
        )?;

        let outcome = self.reconcile(&goal).await;
        Ok((goal, outcome))
    }

    pub async fn reconcile(&self, goal: &GoalState) -> ReconcileOutcome {
        info!(
            incarnation = %goal.incarnation,
            extensions = goal.descriptors.len(),
            "Reconciling extensions"
        );

        for rejected in &goal.rejected {
            error!(
                extension = rejected.name.as_deref().unwrap_or("<unnamed>"),
                version = rejected.version.as_deref().unwrap_or("<none>"),
                error = %rejected.error,
                "Skipping invalid extension entry"
            );
        }

        let mut descriptors = goal.descriptors.clone();
        for descriptor in descriptors.iter_mut().filter(|d| d.has_location()) {
            if let Err(e) = self.process(goal, descriptor).await {
                warn!(
                    extension = %descriptor.name,
                    version = %descriptor.version,
                    error = %e,
                    "Extension processing stopped"
                );
            }
        }

        info!(incarnation = %goal.incarnation, "Finished processing extensions config");
        ReconcileOutcome {
            incarnation: goal.incarnation.clone(),
            descriptors,
        }
    }

    async fn process(
        &self,
        goal: &GoalState,
        descriptor: &mut ExtensionDescriptor,
    ) -> Result<(), ExtensionError> {
        let log = PluginLog::new(
            &self.ctx.config.extension_log_dir,
            &descriptor.name,
            &descriptor.version,
        );
        if let Err(e) = log.ensure_dir() {
            warn!(dir = %log.dir().display(), error = %e, "Unable to create extension log directory");
        }

        if !descriptor.is_json {
            error!(extension = %descriptor.name, version = %descriptor.version, "Not a JSON extension, skipping");
            return Err(ExtensionError::NotJson);
        }
        log.log(&format!(
            "Found plugin {} version {}",
            descriptor.name, descriptor.version
        ));

        if descriptor.state != RequestedState::Enabled {
            return self.disable_or_uninstall(descriptor, &log).await;
        }

        let previous = self.library().latest_installed(&descriptor.name);
        let requested = LooseVersion::parse(&descriptor.version);
        let newer = previous.as_ref().is_none_or(|p| requested > p.version);
        if newer {
            if let Flow::Restricted = self
                .install_or_upgrade(goal, descriptor, previous.as_ref(), &log)
                .await?
            {
                return Ok(());
            }
        }

        self.enable(goal, descriptor, &log).await?;
        log.log(&format!(
            "Processing completed for {}-{}",
            descriptor.name, descriptor.version
        ));
        Ok(())
    }

    fn record(&self, handler_dir: &Path, state: HandlerState) {
        if let Err(e) = handler_state::set_state(handler_dir, state) {
            warn!(dir = %handler_dir.display(), state = %state, error = %e, "Failed to record handler state");
        }
    }

    async fn disable_or_uninstall(
        &self,
        descriptor: &mut ExtensionDescriptor,
        log: &PluginLog,
    ) -> Result<(), ExtensionError> {
        let (name, version) = (descriptor.name.clone(), descriptor.version.clone());
        let handler_dir = self.library().handler_dir(&name, &version);
        let manifest_path = Library::find_manifest(&handler_dir)
            .ok_or_else(|| ExtensionError::ManifestNotFound(handler_dir.clone()))?;
        descriptor.handler_manifest = Some(HandlerManifest::load(&manifest_path)?);

        match self
            .runner
            .launch(log, &name, &version, LifecycleCommand::Disable, None)
            .await
        {
            Ok(()) => {
                self.record(&handler_dir, HandlerState::Disabled);
                log.log(&format!("{name} is disabled"));
            }
            Err(e) => {
                self.record(&handler_dir, HandlerState::Enabled);
                log.log(&format!("ERROR: Unable to disable {name}: {e}"));
            }
        }

        if descriptor.state == RequestedState::Uninstall {
            match self
                .runner
                .launch(log, &name, &version, LifecycleCommand::Uninstall, None)
                .await
            {
                Ok(()) => self.record(&handler_dir, HandlerState::NotInstalled),
                Err(e) => {
                    self.record(&handler_dir, HandlerState::Installed);
                    log.log(&format!("Unable to uninstall {name}: {e}"));
                }
            }
            fs::remove_dir_all(&handler_dir)?;
            log.log(&format!("{name}-{version} extension files deleted."));
        }
        Ok(())
    }

    async fn install_or_upgrade(
        &self,
        goal: &GoalState,
        descriptor: &mut ExtensionDescriptor,
        previous: Option<&InstalledVersion>,
        log: &PluginLog,
    ) -> Result<Flow, ExtensionError> {
        let (name, version) = (descriptor.name.clone(), descriptor.version.clone());
        let lib = self.library().root().to_path_buf();

        let manifest_bytes = self.download_manifest(descriptor, log).await?;
        fs::create_dir_all(&lib)?;
        fs::write(
            lib.join(format!("{}.{}.manifest", name, goal.incarnation)),
            &manifest_bytes,
        )?;
        let plugin_manifest = PluginManifest::parse(&String::from_utf8_lossy(&manifest_bytes))?;
        let entry = plugin_manifest.version(&version);

        if let (Some(entry), Some(previous)) = (entry, previous) {
            let requested = LooseVersion::parse(&version);
            if entry.disallow_major_upgrade && previous.version.major() != requested.major() {
                log.log("DisallowMajorVersionUpgrade is true, this major version is restricted from upgrade.");
                descriptor.restricted = true;
                return Ok(Flow::Restricted);
            }
        }

        let bundle_uri = entry
            .and_then(|e| e.uri.clone())
            .ok_or_else(|| ExtensionError::MissingBundleUri(version.clone()))?;
        log.log(&format!("Bundle URI = {bundle_uri}"));

        let bundle_path = self.download_bundle(&name, &version, &bundle_uri, log).await?;
        let handler_dir = self.library().handler_dir(&name, &version);
        let target = handler_dir.clone();
        tokio::task::spawn_blocking(move || unpack_bundle(&bundle_path, &target)).await??;
        log.log(&format!("Extracted {bundle_uri} to {}", handler_dir.display()));

        let manifest_dir = Library::find_manifest_dir(&handler_dir)
            .ok_or_else(|| ExtensionError::ManifestNotFound(handler_dir.clone()))?;
        fs::create_dir_all(manifest_dir.join("status"))?;
        fs::create_dir_all(manifest_dir.join("config"))?;
        let settings = self.write_settings(goal, &name, &version, &manifest_dir, log)?;
        write_handler_environment(&manifest_dir, &name, settings, log.dir())?;
        self.record(&handler_dir, HandlerState::NotInstalled);

        // A previous version whose install never completed is left alone.
        let upgrade_from = previous
            .filter(|p| handler_state::get_state(&p.path) != HandlerState::NotInstalled);
        match upgrade_from {
            Some(previous) => self.upgrade(&name, &version, previous, &manifest_dir, log).await,
            None => match self
                .runner
                .launch(log, &name, &version, LifecycleCommand::Install, None)
                .await
            {
                Ok(()) => {
                    self.record(&handler_dir, HandlerState::Installed);
                    log.log(&format!("Installation completed for {name}-{version}"));
                }
                Err(e) => {
                    self.record(&handler_dir, HandlerState::NotInstalled);
                    log.log(&format!("Installation failed for {name}-{version}: {e}"));
                }
            },
        }
        Ok(Flow::Continue)
    }

    async fn upgrade(
        &self,
        name: &str,
        version: &str,
        previous: &InstalledVersion,
        manifest_dir: &Path,
        log: &PluginLog,
    ) {
        let previous_version = previous.version.as_str();
        let previous_dir = &previous.path;
        info!(extension = %name, from = %previous_version, to = %version, "Upgrading extension");

        match self
            .runner
            .launch(log, name, previous_version, LifecycleCommand::Disable, None)
            .await
        {
            Ok(()) => self.record(previous_dir, HandlerState::Disabled),
            Err(e) => {
                self.record(previous_dir, HandlerState::Enabled);
                log.log(&format!(
                    "Unable to disable old plugin {name} version {previous_version}: {e}"
                ));
            }
        }

        if let Err(e) = carry_forward(previous_dir, manifest_dir) {
            error!(extension = %name, error = %e, "Failed to copy status files from previous version");
        }

        let mut success = true;
        match self
            .runner
            .launch(log, name, version, LifecycleCommand::Update, Some(previous_version))
            .await
        {
            Ok(()) => log.log(&format!("Update complete {name}-{version}")),
            Err(e) => {
                success = false;
                log.log(&format!("Update failed for {name}-{version}: {e}"));
            }
        }

        match self
            .runner
            .launch(log, name, previous_version, LifecycleCommand::Uninstall, None)
            .await
        {
            Ok(()) => self.record(previous_dir, HandlerState::NotInstalled),
            Err(e) => {
                success = false;
                self.record(previous_dir, HandlerState::Installed);
                log.log(&format!("Uninstall failed for {name}-{previous_version}: {e}"));
            }
        }

        if previous_dir.is_dir() {
            match fs::remove_dir_all(previous_dir) {
                Ok(()) => log.log(&format!("{name}-{previous_version} extension files deleted.")),
                Err(e) => error!(dir = %previous_dir.display(), error = %e, "Failed to remove old plugin directory"),
            }
        }

        self.ctx
            .events
            .add_extension_event(name, Operation::Upgrade, success, 0, previous_version, "");
    }

    async fn enable(
        &self,
        goal: &GoalState,
        descriptor: &mut ExtensionDescriptor,
        log: &PluginLog,
    ) -> Result<(), ExtensionError> {
        let (name, version) = (descriptor.name.clone(), descriptor.version.clone());
        let handler_dir = self.library().handler_dir(&name, &version);
        let manifest_path = Library::find_manifest(&handler_dir).ok_or_else(|| {
            log.log("HandlerManifest.json not found.");
            ExtensionError::ManifestNotFound(handler_dir.clone())
        })?;
        let manifest = HandlerManifest::load(&manifest_path)?;
        fs::create_dir_all(manifest.dir.join("config"))?;
        self.write_settings(goal, &name, &version, &manifest.dir, log)?;
        descriptor.handler_manifest = Some(manifest);

        if handler_state::get_state(&handler_dir) == HandlerState::NotInstalled {
            match self
                .runner
                .launch(log, &name, &version, LifecycleCommand::Install, None)
                .await
            {
                Ok(()) => self.record(&handler_dir, HandlerState::Installed),
                Err(e) => {
                    self.record(&handler_dir, HandlerState::NotInstalled);
                    log.log(&format!("Installation failed for {name}-{version}: {e}"));
                }
            }
        }

        if handler_state::get_state(&handler_dir) != HandlerState::NotInstalled {
            match self
                .runner
                .launch(log, &name, &version, LifecycleCommand::Enable, None)
                .await
            {
                Ok(()) => {
                    self.record(&handler_dir, HandlerState::Enabled);
                    log.log(&format!("Enable completed for {name}-{version}"));
                }
                Err(e) => {
                    self.record(&handler_dir, HandlerState::Installed);
                    log.log(&format!("Enable failed for {name}-{version}: {e}"));
                }
            }
        }
        Ok(())
    }

    /// Write the current runtime settings to `config/<seq>.settings`.
    fn write_settings(
        &self,
        goal: &GoalState,
        name: &str,
        version: &str,
        manifest_dir: &Path,
        log: &PluginLog,
    ) -> Result<u64, ExtensionError> {
        let settings = goal.runtime_settings(name, version);
        if settings.settings.is_empty() {
            log.log(&format!("No RuntimeSettings for {name} V {version}"));
        } else {
            log.log(&format!("Found RuntimeSettings for {name} V {version}"));
        }
        let path = manifest_dir
            .join("config")
            .join(format!("{}.settings", settings.seq_no));
        fs::write(&path, settings.settings.as_bytes())?;
        debug!(path = %path.display(), "Wrote runtime settings");
        Ok(settings.seq_no)
    }

    async fn download_manifest(
        &self,
        descriptor: &ExtensionDescriptor,
        log: &PluginLog,
    ) -> Result<Vec<u8>, ExtensionError> {
        let locations = std::iter::once(&descriptor.location).chain(descriptor.failover_location.iter());
        for location in locations {
            log.log(&format!(
                "Downloading plugin manifest: {} from {}",
                descriptor.name, location
            ));
            match self.ctx.transport.get(location, &[], true).await {
                Ok(resp) => return Ok(strip_bom(&resp.body).to_vec()),
                Err(e) => log.log(&format!(
                    "Unable to download plugin manifest {} from {}: {}",
                    descriptor.name, location, e
                )),
            }
        }

        let last = descriptor
            .failover_location
            .as_deref()
            .unwrap_or(&descriptor.location);
        self.ctx.events.add_extension_event(
            &descriptor.name,
            Operation::Download,
            false,
            0,
            &descriptor.version,
            &format!("Download manifest fail {last}"),
        );
        Err(ExtensionError::ManifestDownload)
    }

    async fn download_bundle(
        &self,
        name: &str,
        version: &str,
        uri: &str,
        log: &PluginLog,
    ) -> Result<PathBuf, ExtensionError> {
        let events = &self.ctx.events;
        let resp = match self.ctx.transport.get(uri, &[], true).await {
            Ok(resp) => resp,
            Err(e) => {
                events.add_extension_event(
                    name,
                    Operation::Download,
                    false,
                    0,
                    version,
                    &format!("Download zip fail {uri}"),
                );
                log.log(&format!("Unable to download plugin bundle {uri}"));
                return Err(ExtensionError::BundleDownload(e));
            }
        };
        events.add_extension_event(name, Operation::Download, true, 0, version, "Download Success");

        let path = self
            .library()
            .root()
            .join(format!("{}.zip", bundle_file_name(uri)));
        fs::write(&path, &resp.body)?;
        log.log(&format!(
            "Plugin bundle {uri} downloaded successfully length = {}",
            resp.body.len()
        ));
        Ok(path)
    }
}

/// Last path segment of `uri`, without query or fragment.
fn bundle_file_name(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "bundle",
    }
}

/// Extract `zip_path` into `target` and mark every file owner-executable.
fn unpack_bundle(zip_path: &Path, target: &Path) -> Result<(), ExtensionError> {
    let file = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(target)?;

    for entry in WalkDir::new(target).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            make_executable(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o100);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Copy the previous version's status files and `mrseq` marker forward.
fn carry_forward(previous_dir: &Path, manifest_dir: &Path) -> std::io::Result<()> {
    let previous_root =
        Library::find_manifest_dir(previous_dir).unwrap_or_else(|| previous_dir.to_path_buf());

    let old_status = previous_root.join("status");
    if old_status.is_dir() {
        let new_status = manifest_dir.join("status");
        fs::create_dir_all(&new_status)?;
        for entry in fs::read_dir(&old_status)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() {
                fs::copy(&path, new_status.join(entry.file_name()))?;
            }
        }
    }

    let mrseq = previous_root.join("mrseq");
    if mrseq.is_file() {
        fs::copy(&mrseq, manifest_dir.join("mrseq"))?;
    }
    Ok(())
}

/// Write `HandlerEnvironment.json` describing where the extension should
/// log, read settings and report status.
fn write_handler_environment(
    manifest_dir: &Path,
    name: &str,
    seq_no: u64,
    log_dir: &Path,
) -> Result<(), ExtensionError> {
    let environment = serde_json::json!([{
        "name": name,
        "seqNo": seq_no.to_string(),
        "version": 1.0,
        "handlerEnvironment": {
            "logFolder": log_dir.display().to_string(),
            "configFolder": manifest_dir.join("config").display().to_string(),
            "statusFolder": manifest_dir.join("status").display().to_string(),
            "heartbeatFile": manifest_dir.join(HEARTBEAT_FILE).display().to_string(),
        }
    }]);
    fs::write(
        manifest_dir.join("HandlerEnvironment.json"),
        environment.to_string(),
    )?;
    Ok(())
}
