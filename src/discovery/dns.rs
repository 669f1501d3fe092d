use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{system_conf, TokioAsyncResolver};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Discoverer, TargetGroup};
use crate::config::duration;
use crate::labels::{LabelSet, ADDRESS_LABEL};

/// Name of the queried record, attached to every discovered target.
const DNS_NAME_LABEL: &str = "__meta_dns_name";

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    #[default]
    Srv,
    A,
    Aaaa,
}

/// DNS-based discovery: a list of names queried on an interval. SRV
/// records carry their own ports; A/AAAA records use `port`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSdConfig {
    pub names: Vec<String>,

    #[serde(default, rename = "type")]
    pub record_type: RecordType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_refresh_interval", with = "duration")]
    pub refresh_interval: Duration,
}

impl DnsSdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.names.is_empty() {
            return Err("dns_sd_configs entry with no names".into());
        }

        if self.record_type != RecordType::Srv && self.port.is_none() {
            return Err("dns_sd_configs requires \"port\" for A and AAAA records".into());
        }

        Ok(())
    }
}

pub struct DnsProvider {
    config: DnsSdConfig,
    resolver: TokioAsyncResolver,
}

impl DnsProvider {
    pub fn new(config: DnsSdConfig) -> crate::Result<Self> {
        let (resolver_config, options) = system_conf::read_system_conf()?;

        Ok(Self {
            config,
            resolver: TokioAsyncResolver::tokio(resolver_config, options),
        })
    }

    async fn refresh(&self, name: &str) -> TargetGroup {
        let targets = match self.lookup(name).await {
            Ok(addresses) => addresses
                .into_iter()
                .map(|address| {
                    let mut target: LabelSet = [(ADDRESS_LABEL, address)].into_iter().collect();
                    target.insert(DNS_NAME_LABEL, name);
                    target
                })
                .collect(),
            Err(err) => {
                warn!(message = "DNS resolution failed", name, %err);
                vec![]
            }
        };

        TargetGroup {
            targets,
            labels: LabelSet::new(),
            source: name.to_string(),
        }
    }

    async fn lookup(&self, name: &str) -> crate::Result<Vec<String>> {
        match self.config.record_type {
            RecordType::Srv => {
                let lookup = self.resolver.srv_lookup(name).await?;

                Ok(lookup
                    .iter()
                    .map(|srv| {
                        let host = srv.target().to_string();
                        format!("{}:{}", host.trim_end_matches('.'), srv.port())
                    })
                    .collect())
            }
            RecordType::A | RecordType::Aaaa => {
                let port = self
                    .config
                    .port
                    .ok_or("\"port\" is required for A and AAAA records")?;
                let want_v4 = self.config.record_type == RecordType::A;
                let lookup = self.resolver.lookup_ip(name).await?;

                Ok(lookup
                    .iter()
                    .filter(|ip| ip.is_ipv4() == want_v4)
                    .map(|ip| match ip {
                        IpAddr::V4(v4) => format!("{}:{}", v4, port),
                        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
                    })
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Discoverer for DnsProvider {
    async fn run(self: Box<Self>, ctx: CancellationToken, out: mpsc::Sender<Vec<TargetGroup>>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.cancelled() => return,
            }

            let mut groups = Vec::with_capacity(self.config.names.len());
            for name in &self.config.names {
                groups.push(self.refresh(name).await);
            }

            if out.send(groups).await.is_err() {
                return;
            }
        }
    }
}
