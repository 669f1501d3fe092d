use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::labels::LabelSet;

/// How a single rule transforms the label set.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Expand `replacement` with capture groups of `regex` matched
    /// against the concatenated source values, and set `target_label`.
    #[default]
    Replace,
    /// Keep the whole target if the concatenated source values match.
    Keep,
    /// Drop the whole target if the concatenated source values match.
    Drop,
    /// Set `target_label` to the hash of the concatenated source
    /// values, modulo `modulus`.
    HashMod,
    /// Copy each label whose name matches `regex` to the name produced
    /// by expanding `replacement`.
    LabelMap,
    /// Remove labels whose name matches `regex`.
    LabelDrop,
    /// Remove labels whose name does not match `regex`.
    LabelKeep,
}

/// A single relabeling rule. Rules apply in configuration order;
/// `keep` and `drop` short-circuit the chain.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelabelConfig {
    /// Labels whose values are concatenated with `separator` to form
    /// the input of `regex`. A missing label reads as the empty string.
    #[serde(default)]
    pub source_labels: Vec<String>,

    #[serde(default = "default_separator")]
    pub separator: String,

    /// Matched against the full concatenated value (implicitly
    /// anchored).
    #[serde(default = "default_regex", with = "serde_regex")]
    pub regex: Regex,

    #[serde(default)]
    pub modulus: u64,

    #[serde(default)]
    pub target_label: String,

    #[serde(default = "default_replacement")]
    pub replacement: String,

    #[serde(default)]
    pub action: Action,
}

impl RelabelConfig {
    /// Reject rule shapes the engine cannot apply. Called during
    /// config validation so [`relabel`] itself never fails.
    pub fn validate(&self) -> Result<(), String> {
        match self.action {
            Action::Replace if self.target_label.is_empty() => {
                Err("relabel action \"replace\" requires \"target_label\"".into())
            }
            Action::HashMod if self.target_label.is_empty() => {
                Err("relabel action \"hashmod\" requires \"target_label\"".into())
            }
            Action::HashMod if self.modulus == 0 => {
                Err("relabel action \"hashmod\" requires a non-zero \"modulus\"".into())
            }
            _ => Ok(()),
        }
    }
}

fn default_separator() -> String {
    ";".into()
}

fn default_regex() -> Regex {
    Regex::new("^(?:(.*))$").unwrap()
}

fn default_replacement() -> String {
    "$1".into()
}

/// Run `labels` through the rule chain. `None` means the target was
/// dropped.
pub fn relabel(labels: LabelSet, configs: &[RelabelConfig]) -> Option<LabelSet> {
    let mut labels = labels;
    for config in configs {
        labels = apply(labels, config)?;
    }
    Some(labels)
}

fn apply(mut labels: LabelSet, config: &RelabelConfig) -> Option<LabelSet> {
    let value = config
        .source_labels
        .iter()
        .map(|name| labels.get(name.as_str()).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(&config.separator);

    match config.action {
        Action::Drop => {
            if config.regex.is_match(&value) {
                return None;
            }
        }
        Action::Keep => {
            if !config.regex.is_match(&value) {
                return None;
            }
        }
        Action::Replace => {
            if let Some(caps) = config.regex.captures(&value) {
                let mut expanded = String::new();
                caps.expand(&config.replacement, &mut expanded);
                labels.insert(config.target_label.clone(), expanded);
            }
        }
        Action::HashMod => {
            let m = xxh64(value.as_bytes(), 0) % config.modulus;
            labels.insert(config.target_label.clone(), m.to_string());
        }
        Action::LabelMap => {
            let mapped = labels
                .iter()
                .filter_map(|(name, value)| {
                    config.regex.captures(name).map(|caps| {
                        let mut expanded = String::new();
                        caps.expand(&config.replacement, &mut expanded);
                        (expanded, value.to_string())
                    })
                })
                .collect::<Vec<_>>();

            for (name, value) in mapped {
                labels.insert(name, value);
            }
        }
        Action::LabelDrop => labels.retain(|name, _value| !config.regex.is_match(name)),
        Action::LabelKeep => labels.retain(|name, _value| config.regex.is_match(name)),
    }

    Some(labels)
}

mod serde_regex {
    use regex::Regex;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(regex: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(regex.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let pattern = String::deserialize(deserializer)?;

        // Anchor the pattern so rules always match the full value.
        Regex::new(&format!("^(?:{})$", pattern)).map_err(Error::custom)
    }
}
