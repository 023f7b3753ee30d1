//! vmagent guest agent library
//!
//! The guest agent runs inside a VM and converges its installed extensions
//! onto the goal state published by the host wire server. It downloads and
//! unpacks extension bundles, drives their lifecycle commands, and reports
//! aggregate status and telemetry back to the host.
//!
//! ## Architecture
//!
//! - **Reconciler**: one pass per goal-state document, run in the main task
//! - **Status**: collects per-extension status and heartbeat files and
//!   uploads the aggregate to the status blob
//! - **Telemetry batcher**: background task draining the event queue
//! - **Environment monitor**: background task reaping extension processes
//!   and republishing the hostname

pub mod children;
pub mod command;
pub mod config;
pub mod context;
pub mod goal_state;
pub mod handler_state;
pub mod host;
pub mod library;
pub mod manifest;
pub mod monitor;
pub mod plugin_log;
pub mod reconciler;
pub mod status;
pub mod telemetry;

pub use config::Config;
pub use context::{AgentContext, AgentState};
pub use goal_state::{ExtensionDescriptor, GoalState, GoalStateError, RequestedState};
pub use handler_state::HandlerState;
pub use host::{HostOps, LinuxHost};
pub use monitor::{EnvMonitor, MonitorConfig};
pub use reconciler::{ReconcileOutcome, Reconciler};
