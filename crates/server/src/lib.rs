//! Real-time delivery core: a relay that routes signaling and chat payloads
//! between connected peers. Unreachable recipients fall back to the offline
//! mailbox, and presence stays fresh under a TTL.
//!
//! The embedding layer (HTTP adaptation, the shipped binary) drives the core
//! through [`app::SottoApp`]; live transports enter through
//! [`transport::run_listener`].

pub mod app;
pub mod config;
pub mod metrics;
pub mod transport;
pub mod util;
