//! Types and interfaces that plugins use to interact with the
//! Manifold framework.
//!
//! A plugin exposes hardware to the central monitoring server through
//! three things: declarative device configuration, a set of named
//! [`handler::Handler`] bundles, and the runtime provided by the
//! `manifold-plugin` crate. This crate holds everything a handler
//! author touches: the error taxonomy, reading and value types, tags,
//! transforms, and the handler interface itself.

pub mod device;
pub mod handler;
pub mod transform;
pub mod types;

pub use types::Error;

/// A `Result` type where the error value is a value from
/// `manifold_api::types::Error`.

pub type Result<T> = std::result::Result<T, types::Error>;
