use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de};
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::relabel::RelabelConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path:?} failed, {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config failed, {0}")]
    Parse(String),

    #[error("invalid config, {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// The format used to represent the configuration data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum Format {
    JSON,
    #[default]
    YAML,
}

impl Format {
    pub fn from_path<T: AsRef<Path>>(path: T) -> Result<Self, T> {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(Format::YAML),
            Some("json") => Ok(Format::JSON),
            _ => Err(path),
        }
    }
}

/// Parse the string represented in the specified format.
pub fn deserialize<T>(content: &str, format: Format) -> Result<T, ConfigError>
where
    T: de::DeserializeOwned,
{
    match format {
        Format::YAML => serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
        Format::JSON => serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
    }
}

/// The URL scheme used for the published addresses.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a server group needs to know, which discovery sources feed it,
/// how discovered targets are rewritten and how their URLs are built.
///
/// ```yaml
/// scheme: https
/// relabel_configs:
///   - source_labels: [__address__]
///     regex: '10\..*'
///     action: drop
/// static_configs:
///   - targets: ["192.168.0.1:443"]
/// dns_sd_configs:
///   - names: [_api._tcp.example.com]
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scheme: Scheme,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabel_configs: Vec<RelabelConfig>,

    #[serde(flatten)]
    pub hosts: DiscoveryConfig,
}

impl Config {
    /// Load and validate the config file, the format is picked by the file
    /// extension and falls back to YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let format = Format::from_path(path).unwrap_or_default();

        Config::load_from_str(&content, format)
    }

    pub fn load_from_str(content: &str, format: Format) -> Result<Config, ConfigError> {
        let config: Config = deserialize(content, format)?;
        config.validate()?;

        Ok(config)
    }

    #[inline]
    pub fn scheme(&self) -> &'static str {
        self.scheme.as_str()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self
            .relabel_configs
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| {
                rule.validate()
                    .err()
                    .map(|err| format!("relabel_configs[{index}]: {err}"))
            })
            .collect::<Vec<_>>();

        errors.extend(self.hosts.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::discovery::QueryType;
    use crate::relabel::Action;

    #[test]
    fn default_scheme() {
        let config = Config::load_from_str("static_configs: []", Format::YAML).unwrap();
        assert_eq!(config.scheme(), "http");
        assert!(config.relabel_configs.is_empty());
    }

    #[test]
    fn full_yaml() {
        let text = r#"
scheme: https
relabel_configs:
  - source_labels: [__address__]
    regex: '10\..*'
    action: drop
static_configs:
  - targets: ["192.168.0.1:443", "192.168.0.2:443"]
    labels:
      env: prod
file_sd_configs:
  - files: ["/etc/servergroup/*.yaml"]
    refresh_interval: 1m
dns_sd_configs:
  - names: [_api._tcp.example.com]
  - names: [api.example.com]
    type: A
    port: 8080
"#;

        let config = Config::load_from_str(text, Format::YAML).unwrap();
        assert_eq!(config.scheme, Scheme::Https);
        assert_eq!(config.relabel_configs.len(), 1);
        assert_eq!(config.relabel_configs[0].action, Action::Drop);

        let hosts = &config.hosts;
        assert_eq!(hosts.static_configs.len(), 1);
        assert_eq!(hosts.static_configs[0].targets.len(), 2);
        assert_eq!(hosts.static_configs[0].labels["env"], "prod");
        assert_eq!(hosts.file_sd_configs[0].refresh_interval, Duration::from_secs(60));
        assert_eq!(hosts.dns_sd_configs[0].query_type, QueryType::SRV);
        assert_eq!(hosts.dns_sd_configs[0].refresh_interval, Duration::from_secs(30));
        assert_eq!(hosts.dns_sd_configs[1].query_type, QueryType::A);
        assert_eq!(hosts.dns_sd_configs[1].port, 8080);
    }

    #[test]
    fn json() {
        let text = r#"{"scheme": "https", "static_configs": [{"targets": ["a:1"]}]}"#;

        let config = Config::load_from_str(text, Format::JSON).unwrap();
        assert_eq!(config.scheme(), "https");
        assert_eq!(config.hosts.static_configs[0].targets, vec!["a:1".to_string()]);
    }

    #[test]
    fn unknown_scheme() {
        let err = Config::load_from_str("scheme: ftp", Format::YAML).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_rules_and_sources() {
        let text = r#"
relabel_configs:
  - action: replace
dns_sd_configs:
  - names: [api.example.com]
    type: A
"#;

        match Config::load_from_str(text, Format::YAML).unwrap_err() {
            ConfigError::Invalid(errors) => {
                assert_eq!(errors.len(), 2, "{errors:?}");
                assert!(errors[0].starts_with("relabel_configs[0]"));
                assert!(errors[1].starts_with("dns_sd_configs[0]"));
            }
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[test]
    fn format_from_path() {
        assert_eq!(Format::from_path("a.yml"), Ok(Format::YAML));
        assert_eq!(Format::from_path("a.yaml"), Ok(Format::YAML));
        assert_eq!(Format::from_path("a.json"), Ok(Format::JSON));
        assert_eq!(Format::from_path("a.toml"), Err("a.toml"));
    }

    #[test]
    fn load_missing_file() {
        let err = Config::load("/path/not/exists.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
