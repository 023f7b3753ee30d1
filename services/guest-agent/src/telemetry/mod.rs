//! Telemetry: the on-disk event queue and the batcher that ships it.

pub mod batcher;
pub mod event;
pub mod identity;

pub use batcher::{BatcherConfig, TelemetryBatcher};
pub use event::{EventError, EventQueue, Operation, TelemetryEvent};
pub use identity::SystemIdentity;
