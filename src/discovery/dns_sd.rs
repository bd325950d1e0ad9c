use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use serde::{Deserialize, Serialize};
use tripwire::Tripwire;

use super::{Discoverer, Error, Updates};
use crate::target::{ADDRESS_LABEL, Labels, META_LABEL_PREFIX, TargetGroup};

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum QueryType {
    #[default]
    SRV,
    A,
    AAAA,
}

/// Periodically resolves DNS names into targets.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSdConfig {
    /// A list of DNS domain names to be queried
    pub names: Vec<String>,

    /// The type of DNS query to perform.
    #[serde(default, rename = "type")]
    pub query_type: QueryType,

    /// The port number used if the query type is not SRV
    #[serde(default)]
    pub port: u16,

    /// The time after which the provided names are refreshed
    #[serde(
        default = "default_refresh_interval",
        with = "humanize::duration::serde"
    )]
    pub refresh_interval: Duration,
}

impl DnsSdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.names.is_empty() {
            return Err("at least one name required".to_string());
        }

        if self.query_type != QueryType::SRV && self.port == 0 {
            return Err(format!("port required for {:?} queries", self.query_type));
        }

        Ok(())
    }
}

fn name_label() -> String {
    format!("{META_LABEL_PREFIX}dns_name")
}

pub struct DnsDiscoverer {
    names: Vec<String>,
    query_type: QueryType,
    port: u16,
    interval: Duration,

    resolver: Arc<TokioAsyncResolver>,
}

impl DnsDiscoverer {
    pub fn new(config: &DnsSdConfig) -> Result<Self, Error> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        Ok(DnsDiscoverer {
            names: config.names.clone(),
            query_type: config.query_type,
            port: config.port,
            interval: config.refresh_interval,
            resolver: Arc::new(resolver),
        })
    }

    async fn refresh(&self) -> Vec<TargetGroup> {
        let lookups = self.names.iter().map(|name| async move {
            let result = query(&self.resolver, name, self.query_type, self.port).await;
            (name, result)
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(name, result)| group_of(name, self.query_type, result))
            .collect()
    }
}

/// An answer without records removes the group of `name`, any other failure
/// keeps its previous group in place.
fn group_of(
    name: &str,
    query_type: QueryType,
    result: Result<Vec<String>, ResolveError>,
) -> Option<TargetGroup> {
    match result {
        Ok(addresses) => Some(to_group(name, addresses)),
        Err(err) => match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                debug!(message = "no records found", name, ?query_type, ?response_code);
                Some(to_group(name, vec![]))
            }
            _ => {
                warn!(message = "dns lookup failed", name, ?query_type, %err);
                None
            }
        },
    }
}

fn to_group(name: &str, addresses: Vec<String>) -> TargetGroup {
    let targets = addresses
        .into_iter()
        .map(|address| {
            Labels::from([
                (ADDRESS_LABEL.to_string(), address),
                (name_label(), name.to_string()),
            ])
        })
        .collect();

    TargetGroup {
        targets,
        labels: Labels::new(),
        source: name.to_string(),
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", host.trim_end_matches('.'), port),
    }
}

async fn query(
    resolver: &TokioAsyncResolver,
    name: &str,
    query_type: QueryType,
    default_port: u16,
) -> Result<Vec<String>, ResolveError> {
    let addresses = match query_type {
        QueryType::SRV => resolver
            .srv_lookup(name)
            .await?
            .into_iter()
            .map(|srv| join_host_port(&srv.target().to_utf8(), srv.port()))
            .collect(),
        QueryType::A => resolver
            .ipv4_lookup(name)
            .await?
            .into_iter()
            .map(|record| SocketAddr::new(IpAddr::V4(record.0), default_port).to_string())
            .collect(),
        QueryType::AAAA => resolver
            .ipv6_lookup(name)
            .await?
            .into_iter()
            .map(|record| SocketAddr::new(IpAddr::V6(record.0), default_port).to_string())
            .collect(),
    };

    Ok(addresses)
}

#[async_trait::async_trait]
impl Discoverer for DnsDiscoverer {
    async fn run(self: Box<Self>, mut shutdown: Tripwire, updates: Updates) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let groups = tokio::select! {
                _ = &mut shutdown => break,
                groups = self.refresh() => groups,
            };

            if !updates.send(groups).await {
                break;
            }
        }
    }
}
