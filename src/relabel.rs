//! Rule driven rewriting and filtering of target label sets.
//!
//! The rules follow the Prometheus `relabel_configs` model. Each rule joins the
//! values of its `source_labels`, matches the result against a fully anchored
//! regex and then acts on the label set according to its `action`.

use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::target::Labels;

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, Error, PartialEq)]
pub enum RelabelError {
    #[error("relabel configuration for {0} action requires 'target_label' value")]
    MissingTargetLabel(Action),

    #[error("{0:?} is invalid 'target_label' for {1} action")]
    InvalidTargetLabel(String, Action),

    #[error("relabel configuration for hashmod requires non-zero modulus")]
    ZeroModulus,

    #[error("{0} action requires only 'regex', and no other fields")]
    OnlyRegex(Action),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Replace the target label with the expanded replacement, if the regex
    /// matches the joined source labels.
    #[default]
    Replace,
    /// Drop targets for which the regex does not match the joined source labels.
    Keep,
    /// Drop targets for which the regex matches the joined source labels.
    Drop,
    /// Set the target label to the modulus of a hash of the joined source labels.
    HashMod,
    /// Copy the values of every label matching the regex to the label name
    /// given by the replacement.
    LabelMap,
    /// Remove every label matching the regex.
    LabelDrop,
    /// Remove every label not matching the regex.
    LabelKeep,
    /// Maps the concatenated source_labels to their lower case.
    Lowercase,
    /// Maps the concatenated source_labels to their upper case.
    Uppercase,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Replace => "replace",
            Action::Keep => "keep",
            Action::Drop => "drop",
            Action::HashMod => "hashmod",
            Action::LabelMap => "labelmap",
            Action::LabelDrop => "labeldrop",
            Action::LabelKeep => "labelkeep",
            Action::Lowercase => "lowercase",
            Action::Uppercase => "uppercase",
        };

        f.write_str(s)
    }
}

/// A regex that always matches the whole input.
#[derive(Clone)]
pub struct Regex {
    pattern: String,
    inner: regex::Regex,
}

impl Regex {
    pub fn new(pattern: &str) -> Result<Regex, regex::Error> {
        let inner = regex::Regex::new(&format!("^(?:{pattern})$"))?;

        Ok(Regex {
            pattern: pattern.to_string(),
            inner,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    #[inline]
    pub fn is_match(&self, s: &str) -> bool {
        self.inner.is_match(s)
    }
}

impl Default for Regex {
    fn default() -> Self {
        Regex::new(DEFAULT_REGEX).expect("default regex is valid")
    }
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.pattern, f)
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Regex::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Regex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_replacement() -> String {
    DEFAULT_REPLACEMENT.to_string()
}

/// RelabelConfig is the configuration for relabeling of target label sets.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelabelConfig {
    /// A list of labels from which values are taken and concatenated
    /// with the configured separator in order.
    #[serde(default)]
    pub source_labels: Vec<String>,

    /// Separator is the string between concatenated values from the source labels.
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Regex against which the concatenation is matched.
    #[serde(default)]
    pub regex: Regex,

    /// Modulus to take of the hash of concatenated values from the source labels.
    #[serde(default)]
    pub modulus: u64,

    /// The label to which the resulting string is written in a replacement.
    /// Regexp interpolation is allowed for the replace action.
    #[serde(default)]
    pub target_label: String,

    /// Replacement is the regex replacement pattern to be used.
    #[serde(default = "default_replacement")]
    pub replacement: String,

    /// Action is the action to be performed for the relabeling.
    #[serde(default)]
    pub action: Action,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        RelabelConfig {
            source_labels: vec![],
            separator: default_separator(),
            regex: Regex::default(),
            modulus: 0,
            target_label: String::new(),
            replacement: default_replacement(),
            action: Action::default(),
        }
    }
}

impl RelabelConfig {
    pub fn validate(&self) -> Result<(), RelabelError> {
        match self.action {
            Action::Replace => {
                if self.target_label.is_empty() {
                    return Err(RelabelError::MissingTargetLabel(self.action));
                }

                // interpolated names are checked when the rule is applied
                if !self.target_label.contains('$') && !is_valid_label_name(&self.target_label) {
                    return Err(RelabelError::InvalidTargetLabel(
                        self.target_label.clone(),
                        self.action,
                    ));
                }
            }
            Action::HashMod | Action::Lowercase | Action::Uppercase => {
                if self.target_label.is_empty() {
                    return Err(RelabelError::MissingTargetLabel(self.action));
                }

                if !is_valid_label_name(&self.target_label) {
                    return Err(RelabelError::InvalidTargetLabel(
                        self.target_label.clone(),
                        self.action,
                    ));
                }

                if self.action == Action::HashMod && self.modulus == 0 {
                    return Err(RelabelError::ZeroModulus);
                }
            }
            Action::LabelDrop | Action::LabelKeep => {
                if !self.source_labels.is_empty()
                    || !self.target_label.is_empty()
                    || self.modulus != 0
                    || self.separator != DEFAULT_SEPARATOR
                    || self.replacement != DEFAULT_REPLACEMENT
                {
                    return Err(RelabelError::OnlyRegex(self.action));
                }
            }
            Action::Keep | Action::Drop | Action::LabelMap => {}
        }

        Ok(())
    }

    fn joined(&self, labels: &Labels) -> String {
        self.source_labels
            .iter()
            .map(|name| labels.get(name).map(String::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Apply the rule, returns false if the target should be dropped.
    fn apply(&self, labels: &mut Labels) -> bool {
        match self.action {
            Action::Keep => {
                let value = self.joined(labels);
                if !self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::Drop => {
                let value = self.joined(labels);
                if self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::Replace => {
                let value = self.joined(labels);
                let Some(captures) = self.regex.inner.captures(&value) else {
                    return true;
                };

                let mut target = String::new();
                captures.expand(&self.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }

                let mut replaced = String::new();
                captures.expand(&self.replacement, &mut replaced);
                if replaced.is_empty() {
                    labels.remove(&target);
                } else {
                    labels.insert(target, replaced);
                }
            }
            Action::HashMod => {
                // rejected by validate, rules built in code may skip it
                if self.modulus == 0 {
                    return true;
                }

                let value = self.joined(labels);
                let mut hasher = Md5::new();
                hasher.update(value.as_bytes());
                let digest = hasher.finalize();

                let mut tail = [0u8; 8];
                tail.copy_from_slice(&digest[8..]);
                let m = u64::from_be_bytes(tail) % self.modulus;

                labels.insert(self.target_label.clone(), m.to_string());
            }
            Action::LabelMap => {
                let mapped = labels
                    .iter()
                    .filter(|(name, _)| self.regex.is_match(name))
                    .map(|(name, value)| {
                        let name = self
                            .regex
                            .inner
                            .replace_all(name, self.replacement.as_str())
                            .into_owned();
                        (name, value.clone())
                    })
                    .collect::<Vec<_>>();

                labels.extend(mapped);
            }
            Action::LabelDrop => labels.retain(|name, _| !self.regex.is_match(name)),
            Action::LabelKeep => labels.retain(|name, _| self.regex.is_match(name)),
            Action::Lowercase => {
                let value = self.joined(labels).to_lowercase();
                labels.insert(self.target_label.clone(), value);
            }
            Action::Uppercase => {
                let value = self.joined(labels).to_uppercase();
                labels.insert(self.target_label.clone(), value);
            }
        }

        true
    }
}

/// Returns the relabeled labels, or `None` if a rule dropped the
/// target. Rules are applied in order and the first drop wins.
pub fn process(mut labels: Labels, rules: &[RelabelConfig]) -> Option<Labels> {
    for rule in rules {
        if !rule.apply(&mut labels) {
            return None;
        }
    }

    Some(labels)
}

/// Label names match `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::target::ADDRESS_LABEL;

    macro_rules! labels {
        ( $($k:expr => $v:expr),* $(,)? ) => {
            Labels::from([ $( ($k.to_string(), $v.to_string()) ),* ])
        };
    }

    fn rule(text: &str) -> RelabelConfig {
        let rule: RelabelConfig = serde_yaml::from_str(text).unwrap();
        rule.validate().unwrap();
        rule
    }

    fn assert_process(input: Labels, rules: &[RelabelConfig], want: Option<Labels>) {
        assert_eq!(process(input, rules), want);
    }

    #[test]
    fn defaults() {
        let rule: RelabelConfig = serde_yaml::from_str("target_label: foo").unwrap();

        assert_eq!(rule.separator, ";");
        assert_eq!(rule.regex.as_str(), "(.*)");
        assert_eq!(rule.replacement, "$1");
        assert_eq!(rule.action, Action::Replace);
    }

    #[test]
    fn drop_by_address_prefix() {
        let rules = [rule(
            r#"
source_labels: [__address__]
regex: '10\..*'
action: drop
"#,
        )];

        assert_process(labels!(ADDRESS_LABEL => "10.0.0.1:80"), &rules, None);
        assert_process(
            labels!(ADDRESS_LABEL => "192.168.0.1:80"),
            &rules,
            Some(labels!(ADDRESS_LABEL => "192.168.0.1:80")),
        );
    }

    #[test]
    fn keep() {
        let rules = [rule(
            r#"
source_labels: [env]
regex: prod
action: keep
"#,
        )];

        assert_process(labels!("env" => "dev"), &rules, None);
        // missing label joins as empty string
        assert_process(labels!("a" => "b"), &rules, None);
        assert_process(
            labels!("env" => "prod"),
            &rules,
            Some(labels!("env" => "prod")),
        );
    }

    #[test]
    fn regex_is_anchored() {
        let rules = [rule(
            r#"
source_labels: [env]
regex: prod
action: drop
"#,
        )];

        assert_process(
            labels!("env" => "preprod"),
            &rules,
            Some(labels!("env" => "preprod")),
        );
    }

    #[test]
    fn replace() {
        let rules = [rule(
            r#"
source_labels: [__meta_dns_name, port]
separator: ':'
regex: '(.+):(\d+)'
target_label: __address__
replacement: '${1}:${2}'
"#,
        )];

        assert_process(
            labels!("__meta_dns_name" => "example.com", "port" => "8080"),
            &rules,
            Some(labels!(
                "__meta_dns_name" => "example.com",
                "port" => "8080",
                ADDRESS_LABEL => "example.com:8080",
            )),
        );

        // no match leaves the labels untouched
        assert_process(
            labels!("__meta_dns_name" => "example.com"),
            &rules,
            Some(labels!("__meta_dns_name" => "example.com")),
        );
    }

    #[test]
    fn replace_with_empty_result_deletes() {
        let rules = [rule(
            r#"
source_labels: [a]
regex: '(.*)'
target_label: b
"#,
        )];

        assert_process(labels!("b" => "old"), &rules, Some(labels!()));
    }

    #[test]
    fn replace_interpolated_target() {
        let rules = [rule(
            r#"
source_labels: [a]
regex: '(\w+)-(\w+)'
target_label: '${1}'
replacement: '${2}'
"#,
        )];

        assert_process(
            labels!("a" => "foo-bar"),
            &rules,
            Some(labels!("a" => "foo-bar", "foo" => "bar")),
        );
    }

    #[test]
    fn hashmod() {
        let rules = [rule(
            r#"
source_labels: [c]
target_label: shard
modulus: 1000
action: hashmod
"#,
        )];

        assert_process(
            labels!("c" => "baz"),
            &rules,
            Some(labels!("c" => "baz", "shard" => "976")),
        );
    }

    #[test]
    fn labelmap() {
        let rules = [rule(
            r#"
regex: '__meta_(.+)'
action: labelmap
"#,
        )];

        assert_process(
            labels!("__meta_dns_name" => "example.com", "a" => "b"),
            &rules,
            Some(labels!(
                "__meta_dns_name" => "example.com",
                "dns_name" => "example.com",
                "a" => "b",
            )),
        );
    }

    #[test]
    fn labeldrop_and_labelkeep() {
        let drop = [rule(
            r#"
regex: 'b.*'
action: labeldrop
"#,
        )];
        assert_process(
            labels!("a" => "foo", "b1" => "bar", "b2" => "baz"),
            &drop,
            Some(labels!("a" => "foo")),
        );

        let keep = [rule(
            r#"
regex: 'b.*'
action: labelkeep
"#,
        )];
        assert_process(
            labels!("a" => "foo", "b1" => "bar", "b2" => "baz"),
            &keep,
            Some(labels!("b1" => "bar", "b2" => "baz")),
        );
    }

    #[test]
    fn lowercase_and_uppercase() {
        let rules = [
            rule("{source_labels: [a], target_label: lower, action: lowercase}"),
            rule("{source_labels: [a], target_label: upper, action: uppercase}"),
        ];

        assert_process(
            labels!("a" => "MiXed"),
            &rules,
            Some(labels!("a" => "MiXed", "lower" => "mixed", "upper" => "MIXED")),
        );
    }

    #[test]
    fn first_drop_wins() {
        let rules = [
            rule("{source_labels: [a], regex: x, action: drop}"),
            rule("{source_labels: [a], target_label: b}"),
        ];

        assert_process(labels!("a" => "x"), &rules, None);
        assert_process(
            labels!("a" => "y"),
            &rules,
            Some(labels!("a" => "y", "b" => "y")),
        );
    }

    #[test]
    fn validate() {
        for (text, want) in [
            ("action: replace", RelabelError::MissingTargetLabel(Action::Replace)),
            (
                "{action: replace, target_label: '1abc'}",
                RelabelError::InvalidTargetLabel("1abc".to_string(), Action::Replace),
            ),
            ("action: lowercase", RelabelError::MissingTargetLabel(Action::Lowercase)),
            ("{action: hashmod, target_label: a}", RelabelError::ZeroModulus),
            (
                "{action: labeldrop, source_labels: [a]}",
                RelabelError::OnlyRegex(Action::LabelDrop),
            ),
        ] {
            let rule: RelabelConfig = serde_yaml::from_str(text).unwrap();
            assert_eq!(rule.validate(), Err(want), "{text}");
        }
    }

    #[test]
    fn invalid_regex() {
        let result = serde_yaml::from_str::<RelabelConfig>("regex: '('");
        assert!(result.is_err());
    }

    #[test]
    fn label_name() {
        assert!(is_valid_label_name("__address__"));
        assert!(is_valid_label_name("a1"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("1a"));
        assert!(!is_valid_label_name("a-b"));
    }
}
