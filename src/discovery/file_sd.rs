use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tripwire::Tripwire;

use super::{Discoverer, Error, StaticConfig, Updates};
use crate::config::{Format, deserialize};
use crate::target::{META_LABEL_PREFIX, TargetGroup};

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Reads target groups from files matching the given glob patterns. Each file
/// holds a list of static configs, in YAML or JSON.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileSdConfig {
    /// Patterns for files from which target groups are extracted, the last
    /// path segment may contain a single `*`
    pub files: Vec<String>,

    /// The interval after which the files are re-read
    #[serde(
        default = "default_refresh_interval",
        with = "humanize::duration::serde"
    )]
    pub refresh_interval: Duration,
}

impl FileSdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.files.is_empty() {
            return Err("at least one file pattern required".to_string());
        }

        for pattern in &self.files {
            match Format::from_path(pattern) {
                Ok(_) => {}
                Err(_) => {
                    return Err(format!(
                        "invalid file extension of {pattern:?}, must be .json, .yml or .yaml"
                    ));
                }
            }

            if let Err(err) = glob::Pattern::new(pattern) {
                return Err(format!("invalid pattern {pattern:?}, {err}"));
            }
        }

        Ok(())
    }
}

fn filepath_label() -> String {
    format!("{META_LABEL_PREFIX}filepath")
}

pub struct FileDiscoverer {
    patterns: Vec<String>,
    interval: Duration,

    // groups sent for each file on the last refresh
    sent: BTreeMap<PathBuf, usize>,
}

impl FileDiscoverer {
    pub fn new(config: &FileSdConfig) -> Result<Self, Error> {
        for pattern in &config.files {
            glob::Pattern::new(pattern).map_err(|source| Error::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        Ok(FileDiscoverer {
            patterns: config.files.clone(),
            interval: config.refresh_interval,
            sent: BTreeMap::new(),
        })
    }

    fn list_files(&self) -> Vec<PathBuf> {
        let mut paths = vec![];

        for pattern in &self.patterns {
            match glob::glob(pattern) {
                Ok(entries) => paths.extend(entries.filter_map(|entry| entry.ok())),
                Err(err) => {
                    warn!(message = "invalid file pattern", pattern, ?err);
                }
            }
        }

        paths.sort();
        paths.dedup();
        paths
    }

    async fn refresh(&mut self) -> Vec<TargetGroup> {
        let paths = self.list_files();
        let mut groups = vec![];

        for path in &paths {
            match read_file(path).await {
                Ok(found) => {
                    let previous = self.sent.insert(path.clone(), found.len()).unwrap_or(0);

                    // clean up groups which no longer exist in the file
                    for index in found.len()..previous {
                        groups.push(TargetGroup::new(source(path, index)));
                    }

                    groups.extend(found);
                }
                Err(err) => {
                    // keep the groups of the last successful read
                    warn!(message = "read target file failed", ?path, %err);
                }
            }
        }

        let removed = self
            .sent
            .keys()
            .filter(|path| !paths.contains(path))
            .cloned()
            .collect::<Vec<_>>();
        for path in removed {
            let count = self.sent.remove(&path).unwrap_or(0);

            debug!(message = "target file removed", ?path, groups = count);

            groups.extend((0..count).map(|index| TargetGroup::new(source(&path, index))));
        }

        groups
    }
}

fn source(path: &Path, index: usize) -> String {
    format!("{}:{}", path.display(), index)
}

async fn read_file(path: &Path) -> crate::Result<Vec<TargetGroup>> {
    let content = tokio::fs::read_to_string(path).await?;
    let format = Format::from_path(path).map_err(|_| "unknown file extension")?;
    let configs: Vec<StaticConfig> = deserialize(&content, format)?;

    let filepath = path.display().to_string();
    let groups = configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            config
                .to_group(source(path, index))
                .with_label(filepath_label(), filepath.clone())
        })
        .collect();

    Ok(groups)
}

#[async_trait::async_trait]
impl Discoverer for FileDiscoverer {
    async fn run(mut self: Box<Self>, mut shutdown: Tripwire, updates: Updates) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let groups = self.refresh().await;
            if !updates.send(groups).await {
                break;
            }
        }
    }
}
