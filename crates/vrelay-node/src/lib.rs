//! vrelay-node: validator submission relay
//!
//! Accepts signed submissions from miners, throttles them by stake, hands
//! them to the downstream pipeline and relays them once to peer validators.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod gossip;
pub mod maintenance;
pub mod membership;
pub mod metrics;
pub mod rate_limit;
pub mod seen;
pub mod server;
pub mod sink;
pub mod submission;

pub use config::ServerConfig;
pub use server::{RelayDeps, RelayServer};
