//! Shared agent context.
//!
//! One value carries everything the reconciler, status aggregator,
//! telemetry batcher and environment monitor share. It is built once at
//! startup and passed down explicitly.

use std::sync::Arc;

use vmagent_wire::{RetryPolicy, TransportClient, TransportError};

use crate::children::ChildRegistry;
use crate::command::{CommandPolicy, CommandRunner};
use crate::config::Config;
use crate::host::HostOps;
use crate::library::Library;
use crate::telemetry::EventQueue;

/// Agent-level state reported alongside extension statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Provisioning,
    Ready,
    ProvisioningError(String),
}

impl AgentState {
    pub fn label(&self) -> &'static str {
        match self {
            AgentState::Provisioning => "Provisioning",
            AgentState::Ready => "Ready",
            AgentState::ProvisioningError(_) => "Provisioning Error.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AgentState::Provisioning => "Guest Agent is starting.",
            AgentState::Ready => "GuestAgent is running and accepting new configurations.",
            AgentState::ProvisioningError(message) => message,
        }
    }
}

pub struct AgentContext {
    pub config: Config,
    pub library: Library,
    pub transport: Arc<TransportClient>,
    pub events: EventQueue,
    pub children: ChildRegistry,
    pub host: Arc<dyn HostOps>,
    pub commands: CommandPolicy,
}

impl AgentContext {
    pub fn new(
        config: Config,
        retry: RetryPolicy,
        host: Arc<dyn HostOps>,
    ) -> Result<Self, TransportError> {
        let transport = TransportClient::new(retry, config.http_proxy.clone())?
            .with_base_endpoint(&config.endpoint)?;
        let library = Library::new(config.lib_dir.clone());
        let events = EventQueue::new(library.events_dir());

        Ok(Self {
            config,
            library,
            transport: Arc::new(transport),
            events,
            children: ChildRegistry::new(),
            host,
            commands: CommandPolicy::default(),
        })
    }

    pub fn with_command_policy(mut self, policy: CommandPolicy) -> Self {
        self.commands = policy;
        self
    }

    pub fn command_runner(&self) -> CommandRunner {
        CommandRunner::new(
            self.library.clone(),
            self.events.clone(),
            self.children.clone(),
            self.commands.clone(),
        )
    }
}
