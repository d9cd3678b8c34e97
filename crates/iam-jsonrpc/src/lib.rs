//! iam-jsonrpc: engine-provider protocol over framed JSON-RPC
//!
//! This crate provides:
//! - JSON-RPC 2.0 envelopes and the provider method payloads
//! - Length-delimited transport over subprocess stdio or in-process duplex
//! - Dispatcher with correlation, timeouts and stale-response discarding
//! - Channel pool and typed provider client for the engine
//! - Provider trait and server for the provider side

pub mod client;
pub mod dispatcher;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod transport;

pub use client::ProviderClient;
pub use dispatcher::Dispatcher;
pub use pool::ChannelPool;
pub use provider::Provider;
pub use server::ProviderServer;
pub use transport::{FramedChannel, ProviderCommand, DEFAULT_MAX_FRAME_BYTES};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::client::ProviderClient;
    pub use super::protocol::{
        ApplyParams, ImportParams, PlanParams, ProviderCapabilities, ProviderMetadata,
    };
    pub use super::provider::Provider;
    pub use super::server::ProviderServer;
    pub use super::transport::FramedChannel;
}
