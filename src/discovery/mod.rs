//! Discovery providers and the target set driving them.
//!
//! Each provider resolves one kind of source, static lists, files or DNS, into
//! [`TargetGroup`]s and pushes its full current view through [`Updates`]. The
//! [`TargetSet`] merges the views of all running providers and hands the result
//! to a [`Syncer`].

mod dns_sd;
mod file_sd;
mod static_sd;
mod target_set;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tripwire::Tripwire;

pub use dns_sd::{DnsDiscoverer, DnsSdConfig, QueryType};
pub use file_sd::{FileDiscoverer, FileSdConfig};
pub use static_sd::{StaticConfig, StaticDiscoverer};
pub use target_set::{Driver, Syncer, TargetSet};

use crate::target::TargetGroup;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file pattern {pattern:?}, {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("build dns resolver failed, {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),

    #[error("target set is stopped")]
    Stopped,
}

/// The discovery part of a config, every descriptor becomes one provider.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_sd_configs: Vec<FileSdConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_sd_configs: Vec<DnsSdConfig>,
}

impl DiscoveryConfig {
    /// Returns a message for every invalid descriptor.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        for (index, config) in self.file_sd_configs.iter().enumerate() {
            if let Err(err) = config.validate() {
                errors.push(format!("file_sd_configs[{index}]: {err}"));
            }
        }

        for (index, config) in self.dns_sd_configs.iter().enumerate() {
            if let Err(err) = config.validate() {
                errors.push(format!("dns_sd_configs[{index}]: {err}"));
            }
        }

        errors
    }

    pub fn is_empty(&self) -> bool {
        self.static_configs.is_empty()
            && self.file_sd_configs.is_empty()
            && self.dns_sd_configs.is_empty()
    }
}

/// A named, not yet running provider.
pub type Provider = (String, Box<dyn Discoverer>);

/// Build one provider per descriptor, all static configs share a single one.
/// Providers are named `static/N`, `file/N` and `dns/N`, in config order.
pub fn providers_from_config(config: &DiscoveryConfig) -> Result<Vec<Provider>, Error> {
    let mut providers: Vec<Provider> = vec![];

    if !config.static_configs.is_empty() {
        providers.push((
            "static/0".to_string(),
            Box::new(StaticDiscoverer::new(&config.static_configs)),
        ));
    }

    for (index, file_sd) in config.file_sd_configs.iter().enumerate() {
        providers.push((
            format!("file/{index}"),
            Box::new(FileDiscoverer::new(file_sd)?),
        ));
    }

    for (index, dns_sd) in config.dns_sd_configs.iter().enumerate() {
        providers.push((
            format!("dns/{index}"),
            Box::new(DnsDiscoverer::new(dns_sd)?),
        ));
    }

    Ok(providers)
}

/// Discoverer provides information about target groups. It maintains a set of
/// sources from which TargetGroup can originate.
///
/// `Discoverer` does not know if an actual change happened. It does guarantee
/// that it sends the new TargetGroup whenever a change happens. A group without
/// targets tells the target set that its source is gone.
#[async_trait::async_trait]
pub trait Discoverer: Send {
    /// Runs until `shutdown` resolves or `updates` is closed.
    async fn run(self: Box<Self>, shutdown: Tripwire, updates: Updates);
}

pub(crate) struct Update {
    generation: u64,
    provider: usize,
    groups: Vec<TargetGroup>,
}

/// The channel a running provider pushes its groups through.
#[derive(Clone)]
pub struct Updates {
    generation: u64,
    provider: usize,
    tx: mpsc::Sender<Update>,
}

impl Updates {
    /// Returns false once the target set is gone, the provider should stop.
    pub async fn send(&self, groups: Vec<TargetGroup>) -> bool {
        self.tx
            .send(Update {
                generation: self.generation,
                provider: self.provider,
                groups,
            })
            .await
            .is_ok()
    }
}
