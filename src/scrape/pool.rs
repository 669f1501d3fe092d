use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use super::target::Target;
use crate::http::HttpClient;
use crate::labels::Fingerprint;
use crate::sink::SampleSink;

/// Owns the running scrape loops for one job. Targets are keyed by
/// `(source, fingerprint)`: sources partition the fingerprint space,
/// so equal fingerprints under different sources are distinct targets.
pub struct ScrapePool {
    client: HttpClient,
    sink: Arc<dyn SampleSink>,
    targets: RwLock<HashMap<String, HashMap<Fingerprint, Arc<Target>>>>,
}

impl ScrapePool {
    pub fn new(client: HttpClient, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            client,
            sink,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Align the running set with `desired`. Targets whose
    /// `(source, fingerprint)` is already running are carried over
    /// untouched, new ones are started, and everything else is
    /// stopped. Callers must serialize calls; the lock held across
    /// the whole operation enforces that late callers wait.
    pub async fn sync(&self, desired: &HashMap<String, HashMap<Fingerprint, Arc<Target>>>) {
        let mut running = self.targets.write().await;

        let mut next: HashMap<String, HashMap<Fingerprint, Arc<Target>>> =
            HashMap::with_capacity(desired.len());
        let mut stopping = vec![];

        for (source, targets) in desired {
            let previous = running.get(source);
            let mut kept = HashMap::with_capacity(targets.len());

            for (fingerprint, target) in targets {
                match previous.and_then(|prev| prev.get(fingerprint)) {
                    // The same target existed before: let it run and
                    // discard the new instance.
                    Some(old) => {
                        kept.insert(*fingerprint, old.clone());
                    }
                    None => {
                        target.start(self.client.clone(), self.sink.clone());
                        kept.insert(*fingerprint, target.clone());
                    }
                }
            }

            if let Some(previous) = previous {
                for (fingerprint, old) in previous {
                    if !targets.contains_key(fingerprint) {
                        stopping.push(old.clone());
                    }
                }
            }

            next.insert(source.clone(), kept);
        }

        // Stop scrapers of sources that disappeared completely.
        for (source, previous) in running.iter() {
            if !desired.contains_key(source) {
                stopping.extend(previous.values().cloned());
            }
        }

        // Wait for all stopped scrapers to terminate before installing
        // the new set. This covers flapping targets: a replacement
        // scraper must not insert concurrently with its predecessor
        // still writing a previous sample set.
        join_all(stopping.iter().map(|target| target.stop())).await;

        *running = next;
    }

    /// Stop every running scraper and wait for all of them.
    pub async fn stop(&self) {
        let mut running = self.targets.write().await;

        let stopping = running
            .values()
            .flat_map(|targets| targets.values().cloned())
            .collect::<Vec<_>>();
        join_all(stopping.iter().map(|target| target.stop())).await;

        running.clear();
    }

    /// Snapshot of the currently-running targets.
    pub async fn targets(&self) -> Vec<Arc<Target>> {
        self.targets
            .read()
            .await
            .values()
            .flat_map(|targets| targets.values().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrapeConfig;
    use crate::labels::LabelSet;
    use crate::sink::Sample;

    struct NullSink;

    impl SampleSink for NullSink {
        fn append(&self, _sample: Sample) {}
    }

    fn pool() -> ScrapePool {
        ScrapePool::new(HttpClient::new(), Arc::new(NullSink))
    }

    fn target(address: &str) -> Arc<Target> {
        let config: Arc<ScrapeConfig> =
            Arc::new(serde_yaml::from_str("job_name: test\nscrape_interval: 1h").unwrap());
        let labels: LabelSet = [("__address__", address), ("job", "test")]
            .into_iter()
            .collect();

        Arc::new(Target::new(config, labels.clone(), labels))
    }

    fn desired(
        groups: &[(&str, &[&Arc<Target>])],
    ) -> HashMap<String, HashMap<Fingerprint, Arc<Target>>> {
        groups
            .iter()
            .map(|(source, targets)| {
                (
                    source.to_string(),
                    targets
                        .iter()
                        .map(|target| (target.fingerprint(), Arc::clone(target)))
                        .collect(),
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn sync_starts_preserves_and_stops() {
        let pool = pool();
        let (a, b) = (target("127.0.0.1:1"), target("127.0.0.1:2"));

        pool.sync(&desired(&[("src", &[&a, &b])])).await;
        assert!(a.is_running());
        assert!(b.is_running());

        let c = target("127.0.0.1:3");
        pool.sync(&desired(&[("src", &[&b, &c])])).await;

        // a stopped before sync returned, b untouched, c started
        assert!(!a.is_running());
        assert!(b.is_running());
        assert!(c.is_running());

        // the preserved entry is the original instance
        let running = pool.targets().await;
        assert!(running.iter().any(|target| Arc::ptr_eq(target, &b)));

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_does_not_restart_equal_target() {
        let pool = pool();
        let a = target("127.0.0.1:1");

        pool.sync(&desired(&[("src", &[&a])])).await;

        // same fingerprint, different instance: the in-flight scraper
        // is preserved and the new instance is discarded
        let replacement = target("127.0.0.1:1");
        assert_eq!(a.fingerprint(), replacement.fingerprint());
        pool.sync(&desired(&[("src", &[&replacement])])).await;

        assert!(a.is_running());
        assert!(!replacement.is_running());

        let running = pool.targets().await;
        assert_eq!(running.len(), 1);
        assert!(Arc::ptr_eq(&running[0], &a));

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_source_stops_all_its_targets() {
        let pool = pool();
        let (a, b) = (target("127.0.0.1:1"), target("127.0.0.1:2"));

        pool.sync(&desired(&[("one", &[&a]), ("two", &[&b])])).await;
        pool.sync(&desired(&[("one", &[&a])])).await;

        assert!(a.is_running());
        assert!(!b.is_running());

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sources_partition_fingerprints() {
        let pool = pool();
        let a = target("127.0.0.1:1");
        let twin = target("127.0.0.1:1");

        pool.sync(&desired(&[("one", &[&a]), ("two", &[&twin])]))
            .await;

        // equal fingerprints, distinct sources: both run
        assert!(a.is_running());
        assert!(twin.is_running());
        assert_eq!(pool.targets().await.len(), 2);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_the_pool() {
        let pool = pool();
        let a = target("127.0.0.1:1");

        pool.sync(&desired(&[("src", &[&a])])).await;
        pool.stop().await;

        assert!(!a.is_running());
        assert!(pool.targets().await.is_empty());

        // a later sync starts fresh rather than "preserving" a
        // stopped scraper
        let replacement = target("127.0.0.1:1");
        pool.sync(&desired(&[("src", &[&replacement])])).await;
        assert!(replacement.is_running());
        assert!(!a.is_running());

        pool.stop().await;
    }
}
