use serde::{Deserialize, Serialize};
use tripwire::Tripwire;

use super::{Discoverer, Updates};
use crate::target::{Labels, TargetGroup};

/// A fixed list of targets sharing the same labels, this is also the format of
/// every entry in a file_sd file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    /// Addresses in `host:port` form
    pub targets: Vec<String>,

    /// Labels attached to every target of this config
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

impl StaticConfig {
    pub fn to_group(&self, source: impl Into<String>) -> TargetGroup {
        let mut group = TargetGroup::from_addresses(source, self.targets.iter().cloned());
        group.labels = self.labels.clone();
        group
    }
}

/// Sends its groups once and then idles until shutdown.
pub struct StaticDiscoverer {
    groups: Vec<TargetGroup>,
}

impl StaticDiscoverer {
    pub fn new(configs: &[StaticConfig]) -> Self {
        let groups = configs
            .iter()
            .enumerate()
            .map(|(index, config)| config.to_group(index.to_string()))
            .collect();

        StaticDiscoverer { groups }
    }
}

#[async_trait::async_trait]
impl Discoverer for StaticDiscoverer {
    async fn run(self: Box<Self>, shutdown: Tripwire, updates: Updates) {
        debug!(message = "send static targets", groups = self.groups.len());

        if !updates.send(self.groups).await {
            return;
        }

        shutdown.await
    }
}
