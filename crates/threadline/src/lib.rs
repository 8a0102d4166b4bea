//! Threadline - a resilient, thread-aware bridge between a chat gateway and a message bus.
//!
//! The gateway side is abstracted behind [`client::GatewayClient`]; the bus
//! side receives [`threadline_protocol::BusMessage`]s through
//! [`inbound::BusPublisher`] and hands replies back through
//! [`bridge::Bridge::handle_outbound_message`].

// ============================================================================
// Connection
// ============================================================================

pub mod client;
pub mod supervisor;

// ============================================================================
// Routing and delivery
// ============================================================================

pub mod bridge;
pub mod context;
pub mod dispatch;
pub mod inbound;
pub mod routing;

// ============================================================================
// Configuration
// ============================================================================

pub mod config;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use config::Config;
pub use context::ContextStore;
pub use supervisor::{ConnectionState, Supervisor, SupervisorConfig, SupervisorError};
