mod dns;
mod file;

use std::collections::HashMap;

use async_trait::async_trait;
pub use dns::{DnsProvider, DnsSdConfig, RecordType};
pub use file::{FileProvider, FileSdConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ScrapeConfig;
use crate::labels::{LabelSet, ADDRESS_LABEL};

/// A set of targets with common labels, emitted by a discovery
/// mechanism. `source` uniquely names the group within its provider.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetGroup {
    /// Each target is identified by its label set; discovery fills in
    /// at least `__address__`.
    pub targets: Vec<LabelSet>,

    /// Labels common across all targets in the group.
    pub labels: LabelSet,

    /// Assigned by the provider, never read from configuration.
    pub source: String,
}

// In configuration and discovery files a group's targets are plain
// `host:port` strings; internally every target is a label set.
#[derive(Deserialize, Serialize)]
struct TargetGroupRepr {
    #[serde(default)]
    targets: Vec<String>,

    #[serde(default, skip_serializing_if = "LabelSet::is_empty")]
    labels: LabelSet,
}

impl<'de> Deserialize<'de> for TargetGroup {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = TargetGroupRepr::deserialize(deserializer)?;

        Ok(TargetGroup {
            targets: repr
                .targets
                .into_iter()
                .map(|address| [(ADDRESS_LABEL, address)].into_iter().collect())
                .collect(),
            labels: repr.labels,
            source: String::new(),
        })
    }
}

impl Serialize for TargetGroup {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TargetGroupRepr {
            targets: self
                .targets
                .iter()
                .map(|target| target.get(ADDRESS_LABEL).unwrap_or("").to_string())
                .collect(),
            labels: self.labels.clone(),
        }
        .serialize(serializer)
    }
}

/// A discovery mechanism emitting target group updates.
///
/// Implementations must send the full currently-known set as their
/// first message and a new message on any subsequent change; they need
/// not prove a change actually occurred. `run` must return promptly on
/// cancellation; the update channel closes when it returns.
#[async_trait]
pub trait Discoverer: Send + 'static {
    async fn run(self: Box<Self>, ctx: CancellationToken, out: mpsc::Sender<Vec<TargetGroup>>);
}

/// Build all providers configured for one scrape job, keyed by
/// `{mechanism}/{ordinal}`. A provider whose construction fails is
/// logged and skipped; the rest of the cohort proceeds.
pub fn providers_from_config(config: &ScrapeConfig) -> HashMap<String, Box<dyn Discoverer>> {
    let mut providers: HashMap<String, Box<dyn Discoverer>> = HashMap::new();

    for (i, sd) in config.dns_sd_configs.iter().enumerate() {
        match DnsProvider::new(sd.clone()) {
            Ok(provider) => {
                providers.insert(format!("dns/{}", i), Box::new(provider));
            }
            Err(err) => {
                error!(message = "cannot create DNS discovery", %err);
            }
        }
    }

    for (i, sd) in config.file_sd_configs.iter().enumerate() {
        providers.insert(
            format!("file/{}", i),
            Box::new(FileProvider::new(sd.clone())),
        );
    }

    if !config.static_configs.is_empty() {
        providers.insert(
            "static/0".to_string(),
            Box::new(StaticProvider::new(config.static_configs.clone())),
        );
    }

    providers
}

/// Emits a literally-configured list of target groups once.
pub struct StaticProvider {
    groups: Vec<TargetGroup>,
}

impl StaticProvider {
    /// Sources are assigned ordinals up front so they stay stable
    /// across reloads.
    pub fn new(mut groups: Vec<TargetGroup>) -> Self {
        for (i, group) in groups.iter_mut().enumerate() {
            group.source = i.to_string();
        }

        Self { groups }
    }
}

#[async_trait]
impl Discoverer for StaticProvider {
    async fn run(self: Box<Self>, ctx: CancellationToken, out: mpsc::Sender<Vec<TargetGroup>>) {
        // The consumer may already be gone, in which case the send
        // never completes.
        tokio::select! {
            _ = out.send(self.groups) => {}
            _ = ctx.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_group_from_yaml() {
        let group: TargetGroup = serde_yaml::from_str(
            r#"
            targets: ["localhost:9100"]
            labels:
              env: prod
            "#,
        )
        .unwrap();

        assert_eq!(group.targets.len(), 1);
        assert_eq!(group.targets[0].get(ADDRESS_LABEL), Some("localhost:9100"));
        assert_eq!(group.labels.get("env"), Some("prod"));
        assert_eq!(group.source, "");
    }

    #[tokio::test]
    async fn static_provider_emits_once_and_closes() {
        let groups: Vec<TargetGroup> = serde_yaml::from_str(
            r#"
            - targets: ["a:80"]
            - targets: ["b:80"]
            "#,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let provider = Box::new(StaticProvider::new(groups));
        tokio::spawn(provider.run(CancellationToken::new(), tx));

        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.len(), 2);
        assert_eq!(initial[0].source, "0");
        assert_eq!(initial[1].source, "1");

        // provider is done, channel closed
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn factory_keys() {
        let config: ScrapeConfig = serde_yaml::from_str(
            r#"
            job_name: test
            static_configs:
              - targets: ["a:80"]
            file_sd_configs:
              - files: ["/tmp/targets.yaml"]
              - files: ["/tmp/more.yaml"]
            "#,
        )
        .unwrap();

        let providers = providers_from_config(&config);
        let mut keys = providers.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec!["file/0", "file/1", "static/0"]);
    }
}
