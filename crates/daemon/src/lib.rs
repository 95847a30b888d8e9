//! Wiregate daemon library.
//!
//! Everything the `wiregated` binary wires together: the node
//! registry, the WireGuard engine, routing and proxy reconciliation,
//! service registries, tokens, and the startup/expiry loops.

pub mod config;
pub mod domains;
pub mod expiry;
pub mod netlink;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod services;
pub mod startup;
pub mod sync;
pub mod tokens;
pub mod wg;
