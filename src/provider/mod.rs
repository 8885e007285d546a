//! Tool providers: registry, connections and invocation routing.
//!
//! This module handles:
//! - Persisting provider configs and the tool route table
//! - JSON-RPC 2.0 sessions over child-process stdio or HTTP
//! - Connecting lazily, one live connection per provider
//! - Resolving a tool to its provider and executing the call with retry

pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod router;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use errors::GatewayError;
pub use lifecycle::{ProcessTransportFactory, TransportFactory};
pub use manager::{ConnectionManager, ProviderConnection};
pub use registry::{ImportReport, ProviderRegistry};
pub use retry::RetryPolicy;
pub use router::ToolRouter;
pub use transport::ProviderTransport;
pub use types::{InvocationOutcome, ProviderConfig, ProviderState, ToolDescriptor};
