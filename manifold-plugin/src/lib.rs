//! The runtime of the Manifold device-plugin framework.
//!
//! A plugin embeds this crate, registers its handlers and device
//! configuration against a [`plugin::Plugin`], and calls
//! [`plugin::Plugin::execute`]. The runtime assembles devices,
//! schedules reads and writes, maintains the latest-readings table,
//! tracks write transactions, and serves the RPC operations through
//! [`rpc::PluginService`]; the wire framing of those operations is
//! supplied by the embedding plugin through
//! [`plugin::Plugin::register_server`].

#![deny(unsafe_code)]

pub mod config;
pub mod device;
pub mod meta;
pub mod output;
pub mod plugin;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod transaction;

mod glob;

pub use plugin::Plugin;
