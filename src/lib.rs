//! `servergroup` keeps an always-current, lock-free readable list of backend
//! URLs for a named group of servers.
//!
//! Targets are found by the discovery providers configured in [`Config`],
//! passed through the relabel rules, and published as an atomically swapped
//! [`Snapshot`] by the [`ServerGroup`] coordinator.

pub mod config;
pub mod discovery;
mod group;
pub mod relabel;
pub mod target;

pub use config::{Config, ConfigError, Format, Scheme};
pub use group::{Builder, Error as GroupError, ServerGroup, Snapshot};
pub use target::{ADDRESS_LABEL, Labels, TargetGroup};

#[macro_use]
extern crate tracing;

/// Basic error type, dynamically dispatched and safe to send across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;
