use std::collections::BTreeMap;

/// The label holding the `host:port` of a target.
pub const ADDRESS_LABEL: &str = "__address__";

/// Prefix for labels attached by discovery providers.
pub const META_LABEL_PREFIX: &str = "__meta_";

/// A set of labels describing one target, ordered by label name.
pub type Labels = BTreeMap<String, String>;

/// TargetGroup is a set of targets with a common labels
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetGroup {
    /// `targets` is a list of targets identified by a label set. Each target
    /// is uniquely identifiable in the group by its `address` label
    pub targets: Vec<Labels>,

    /// `labels` is a set of labels that is common across all targets in the group
    pub labels: Labels,

    /// An identifier that describes a group of targets
    pub source: String,
}

impl TargetGroup {
    pub fn new(source: impl Into<String>) -> Self {
        TargetGroup {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Build a group from plain addresses, each one becoming the address label
    /// of a target.
    pub fn from_addresses<I, S>(source: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = addresses
            .into_iter()
            .map(|addr| Labels::from([(ADDRESS_LABEL.to_string(), addr.into())]))
            .collect();

        TargetGroup {
            targets,
            labels: Labels::new(),
            source: source.into(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Yields every target with the group labels merged underneath, target
    /// labels win on conflict.
    pub fn merged_targets(&self) -> impl Iterator<Item = Labels> + '_ {
        self.targets.iter().map(|target| {
            let mut labels = self.labels.clone();
            labels.extend(target.iter().map(|(k, v)| (k.clone(), v.clone())));
            labels
        })
    }
}
