//! Wire plumbing for the guest agent.
//!
//! This crate owns the two pieces of HTTP behavior the agent depends on:
//! the retrying, proxy-aware [`TransportClient`] and the [`BlobClient`]
//! that publishes the aggregate status document as a block or page blob.

pub mod blob;
pub mod error;
pub mod transport;

pub use blob::{page_ranges, BlobClient, BlobType, PageRange};
pub use error::{BlobError, TransportError};
pub use transport::{Endpoint, HttpResponse, ProxyConfig, RetryPolicy, TransportClient};
