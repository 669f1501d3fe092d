use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::header::ACCEPT;
use http::{Request, StatusCode};
use hyper::Body;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::parse;
use crate::config::{check_target_address, ScrapeConfig};
use crate::discovery::TargetGroup;
use crate::http::{HttpClient, HttpError};
use crate::labels::{
    Fingerprint, LabelSet, ADDRESS_LABEL, INSTANCE_LABEL, JOB_LABEL, META_LABEL_PREFIX,
    METRICS_PATH_LABEL, PARAM_LABEL_PREFIX, RESERVED_LABEL_PREFIX, SCHEME_LABEL,
};
use crate::relabel;
use crate::sink::{timestamp_now, Sample, SampleSink};

/// One endpoint to be scraped. Owns its scrape loop once started; its
/// identity is the fingerprint of its final label set.
pub struct Target {
    labels: LabelSet,
    discovered: LabelSet,
    fingerprint: Fingerprint,
    config: Arc<ScrapeConfig>,
    scraper: Mutex<Option<Scraper>>,
}

struct Scraper {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Target {
    pub fn new(config: Arc<ScrapeConfig>, labels: LabelSet, discovered: LabelSet) -> Self {
        let fingerprint = labels.fingerprint();

        Self {
            labels,
            discovered,
            fingerprint,
            config,
            scraper: Mutex::new(None),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The final label set, after relabeling and meta-label stripping.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The label set as discovered, before relabeling.
    pub fn discovered_labels(&self) -> &LabelSet {
        &self.discovered
    }

    pub fn job(&self) -> &str {
        self.labels.get(JOB_LABEL).unwrap_or("")
    }

    pub fn address(&self) -> &str {
        self.labels.get(ADDRESS_LABEL).unwrap_or("")
    }

    /// Labels attached to this target's samples: every non-internal
    /// label, plus `instance` unless relabeling already set one.
    pub fn exported_labels(&self) -> LabelSet {
        let mut labels: LabelSet = self
            .labels
            .iter()
            .filter(|(name, _value)| !name.starts_with(RESERVED_LABEL_PREFIX))
            .collect();

        if !labels.contains(INSTANCE_LABEL) {
            labels.insert(INSTANCE_LABEL, self.address());
        }

        labels
    }

    /// The scrape URL, assembled from labels and configured query
    /// parameters. `__param_*` labels override the first value of the
    /// corresponding parameter.
    pub fn url(&self) -> String {
        let scheme = self.labels.get(SCHEME_LABEL).unwrap_or("http");
        let path = self.labels.get(METRICS_PATH_LABEL).unwrap_or("/metrics");

        let mut params = self.config.params.clone();
        for (name, value) in self.labels.iter() {
            if let Some(key) = name.strip_prefix(PARAM_LABEL_PREFIX) {
                let values = params.entry(key.to_string()).or_default();
                if values.is_empty() {
                    values.push(value.to_string());
                } else {
                    values[0] = value.to_string();
                }
            }
        }

        let mut pairs = params
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |value| (name, value)))
            .collect::<Vec<_>>();
        pairs.sort();

        let mut url = format!("{}://{}{}", scheme, self.address(), path);
        for (i, (name, value)) in pairs.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(value);
        }

        url
    }

    pub fn is_running(&self) -> bool {
        self.scraper.lock().expect("scraper lock poisoned").is_some()
    }

    /// Launch the scrape loop. Callers must start a target at most
    /// once.
    pub fn start(&self, client: HttpClient, sink: Arc<dyn SampleSink>) {
        let stop = CancellationToken::new();
        let loop_ = ScrapeLoop {
            url: self.url(),
            labels: self.exported_labels(),
            interval: self.config.scrape_interval,
            timeout: self.config.scrape_timeout,
            offset: self.offset(),
            client,
            sink,
            stop: stop.clone(),
        };

        let handle = tokio::spawn(loop_.run());
        *self.scraper.lock().expect("scraper lock poisoned") = Some(Scraper { stop, handle });
    }

    /// Stop the scrape loop and wait for it to exit. When this
    /// returns, no further sample will be appended by this target.
    pub async fn stop(&self) {
        let scraper = self.scraper.lock().expect("scraper lock poisoned").take();

        if let Some(Scraper { stop, handle }) = scraper {
            stop.cancel();
            let _ = handle.await;
        }
    }

    /// Deterministic offset of the first scrape within the interval,
    /// spreading scrapes of a large target population over time.
    fn offset(&self) -> Duration {
        let interval = self.config.scrape_interval.as_nanos() as u64;
        if interval == 0 {
            return Duration::ZERO;
        }

        Duration::from_nanos(self.fingerprint.0 % interval)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("labels", &self.labels.to_string())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

struct ScrapeLoop {
    url: String,
    labels: LabelSet,
    interval: Duration,
    timeout: Duration,
    offset: Duration,
    client: HttpClient,
    sink: Arc<dyn SampleSink>,
    stop: CancellationToken,
}

impl ScrapeLoop {
    async fn run(self) {
        let start = Instant::now() + self.offset;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let began = Instant::now();
            let result = tokio::time::timeout(self.timeout, scrape_one(&self.client, &self.url))
                .await
                .unwrap_or(Err(HttpError::Timeout));
            let elapsed = began.elapsed();
            let timestamp = timestamp_now();

            let (samples, up) = match result {
                Ok(body) => (parse::parse_text(&body), 1.0),
                Err(err) => {
                    debug!(
                        message = "scrape failed",
                        instance = %self.url,
                        %err,
                    );

                    (vec![], 0.0)
                }
            };

            for scraped in samples {
                let mut labels = scraped.labels;
                // Target labels win over scraped ones.
                for (name, value) in self.labels.iter() {
                    labels.insert(name, value);
                }

                self.sink.append(Sample {
                    name: scraped.name,
                    labels,
                    value: scraped.value,
                    timestamp: scraped.timestamp.unwrap_or(timestamp),
                });
            }

            self.sink.append(Sample {
                name: "up".into(),
                labels: self.labels.clone(),
                value: up,
                timestamp,
            });
            self.sink.append(Sample {
                name: "scrape_duration_seconds".into(),
                labels: self.labels.clone(),
                value: elapsed.as_secs_f64(),
                timestamp,
            });
        }
    }
}

async fn scrape_one(client: &HttpClient, url: &str) -> Result<String, HttpError> {
    let request = Request::get(url)
        .header(ACCEPT, "text/plain")
        .body(Body::empty())
        .map_err(HttpError::BuildRequest)?;

    let response = client.send(request).await?;
    if response.status() != StatusCode::OK {
        return Err(HttpError::UnexpectedStatusCode(response.status()));
    }

    let body = hyper::body::to_bytes(response.into_body()).await?;

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Build targets from a target group: apply configured parameters and
/// label defaults, relabel, infer missing ports, validate, and key the
/// result by fingerprint. Any hard error discards the whole group.
pub fn targets_from_group(
    group: &TargetGroup,
    config: &Arc<ScrapeConfig>,
) -> crate::Result<HashMap<Fingerprint, Arc<Target>>> {
    let defaults: LabelSet = [
        (SCHEME_LABEL, config.scheme.as_str()),
        (METRICS_PATH_LABEL, config.metrics_path.as_str()),
        (JOB_LABEL, config.job_name.as_str()),
    ]
    .into_iter()
    .collect();

    let mut targets = HashMap::with_capacity(group.targets.len());

    for (i, labels) in group.targets.iter().enumerate() {
        let mut labels = labels.clone();

        for (name, values) in &config.params {
            if let Some(first) = values.first() {
                labels.insert(format!("{}{}", PARAM_LABEL_PREFIX, name), first.clone());
            }
        }

        // Apply label sets in order of decreasing precedence.
        labels.merge_defaults(&group.labels);
        labels.merge_defaults(&defaults);

        if !labels.contains(ADDRESS_LABEL) {
            return Err(format!(
                "instance {} in target group {:?} has no address",
                i, group.source
            )
            .into());
        }

        let discovered = labels.clone();

        let mut labels = match relabel::relabel(labels, &config.relabel_configs) {
            Some(labels) => labels,
            None => continue,
        };

        // If no port was provided, infer it from the scheme.
        let mut address = labels.get(ADDRESS_LABEL).unwrap_or("").to_string();
        if !address.contains(':') {
            match labels.get(SCHEME_LABEL).unwrap_or("") {
                "http" | "" => address.push_str(":80"),
                "https" => address.push_str(":443"),
                scheme => panic!("targets_from_group: invalid scheme {:?}", scheme),
            }
            labels.insert(ADDRESS_LABEL, address.clone());
        }

        check_target_address(&address).map_err(|err| {
            format!("instance {} in target group {:?}: {}", i, group.source, err)
        })?;

        // Meta labels are only meaningful during relabeling; other
        // internal labels propagate to the target, which decides which
        // of them to export.
        labels.retain(|name, _value| !name.starts_with(META_LABEL_PREFIX));

        let target = Arc::new(Target::new(config.clone(), labels, discovered));
        targets.insert(target.fingerprint(), target);
    }

    Ok(targets)
}
