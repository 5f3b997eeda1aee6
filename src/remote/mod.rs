//! Access to a system from other hosts: a TCP gateway speaking a small
//! binary protocol, its client, and UDP discovery.

mod client;
pub mod discovery;
pub(crate) mod server;
pub(crate) mod wire;

pub use client::{RemoteInfo, RemoteSystem};
pub use discovery::{locate, DiscoveryConfig, DiscoveryMethod, Located};
pub use wire::{RemoteEvent, RemoteStationStats};
