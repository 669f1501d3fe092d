use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::pool::ScrapePool;
use super::target::{targets_from_group, Target};
use crate::config::ScrapeConfig;
use crate::discovery::{Discoverer, TargetGroup};
use crate::http::HttpClient;
use crate::labels::Fingerprint;
use crate::sink::SampleSink;

/// Reconciliations are throttled to once per this interval, coalescing
/// bursts of provider churn into a single diff.
const SYNC_THROTTLE: Duration = Duration::from_secs(5);

/// How long to wait for a provider's initial target set before
/// treating it as empty.
const PROVIDER_INITIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial target-group entries a consumer hands back before its
/// ongoing update phase, keyed by `{provider}/{source}`.
type InitialEntries = Vec<(String, HashMap<Fingerprint, Arc<Target>>)>;

/// Runs the discovery providers of one scrape job and drives its
/// [`ScrapePool`] from their updates.
pub struct TargetSet {
    state: RwLock<State>,
    pool: ScrapePool,

    sync_tx: mpsc::Sender<()>,
    // Consumed by `run` only; behind a lock so the loop can be
    // restarted across manager runs.
    sync_rx: Mutex<mpsc::Receiver<()>>,
}

struct State {
    config: Arc<ScrapeConfig>,

    /// The desired target map, keyed by `{provider}/{source}`.
    tgroups: HashMap<String, HashMap<Fingerprint, Arc<Target>>>,

    /// Names of the current provider cohort.
    providers: Vec<String>,

    stop_providers: Option<CancellationToken>,
}

impl TargetSet {
    pub fn new(config: Arc<ScrapeConfig>, client: HttpClient, sink: Arc<dyn SampleSink>) -> Self {
        // Capacity one: a pending signal already covers any number of
        // coalesced updates.
        let (sync_tx, sync_rx) = mpsc::channel(1);

        Self {
            state: RwLock::new(State {
                config,
                tgroups: HashMap::new(),
                providers: vec![],
                stop_providers: None,
            }),
            pool: ScrapePool::new(client, sink),
            sync_tx,
            sync_rx: Mutex::new(sync_rx),
        }
    }

    /// The reconciliation loop: throttle, wait for an update signal,
    /// sync, repeat. On cancellation the pool is stopped, after which
    /// no further storage write happens on behalf of this job.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        let mut sync_rx = self.sync_rx.lock().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(SYNC_THROTTLE) => {}
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = sync_rx.recv() => self.sync().await,
            }
        }

        // Wait for all pending target scrapes to complete, so there
        // will be no more storage writes after this point.
        self.pool.stop().await;
    }

    async fn sync(&self) {
        let snapshot = self.state.read().await.tgroups.clone();
        self.pool.sync(&snapshot).await;
    }

    /// Replace the provider cohort: cancel the previous one, launch
    /// the new providers, wait for each one's initial target set (or
    /// its timeout), and install the result with an immediate sync.
    ///
    /// The state lock is held for the entire time, which may block
    /// concurrent updates for up to the full initial-set window. We
    /// could release earlier with some tweaks, but this is easier to
    /// reason about.
    pub async fn run_providers(
        self: Arc<Self>,
        ctx: &CancellationToken,
        config: Arc<ScrapeConfig>,
        providers: HashMap<String, Box<dyn Discoverer>>,
    ) {
        let mut state = self.state.write().await;

        if let Some(previous) = state.stop_providers.take() {
            previous.cancel();
        }
        let prov_ctx = ctx.child_token();
        state.stop_providers = Some(prov_ctx.clone());
        state.config = config.clone();
        // Entries of the previous cohort must not leak stale scrapers
        // into later syncs.
        state.tgroups.clear();
        state.providers = providers.keys().cloned().collect();
        debug!(
            message = "running target providers",
            job = %config.job_name,
            providers = ?state.providers,
        );

        let mut barriers = vec![];
        for (name, provider) in providers {
            let (updates_tx, updates_rx) = mpsc::channel(16);
            let (initial_tx, initial_rx) = oneshot::channel();
            barriers.push(initial_rx);

            tokio::spawn(consume_updates(
                self.clone(),
                name,
                config.clone(),
                prov_ctx.clone(),
                updates_rx,
                initial_tx,
            ));
            tokio::spawn(provider.run(prov_ctx.clone(), updates_tx));
        }

        // First-sync barrier: every provider has either delivered its
        // initial set or timed out.
        for barrier in barriers {
            if let Ok(entries) = barrier.await {
                for (key, targets) in entries {
                    state.tgroups.insert(key, targets);
                }
            }
        }

        // Install the initial set right away, outside the throttle.
        self.pool.sync(&state.tgroups).await;
    }

    /// Handle one target group update from the provider identified by
    /// `name`.
    async fn update(&self, name: &str, group: &TargetGroup) -> crate::Result<()> {
        let mut state = self.state.write().await;

        let targets = targets_from_group(group, &state.config)?;
        state.tgroups.insert(composite_key(name, group), targets);
        drop(state);

        // Non-blocking: if a signal is already pending, the throttled
        // loop will observe the newest state anyway.
        let _ = self.sync_tx.try_send(());

        Ok(())
    }

    /// Snapshot of the targets currently running for this job.
    pub async fn targets(&self) -> Vec<Arc<Target>> {
        self.pool.targets().await
    }
}

fn composite_key(name: &str, group: &TargetGroup) -> String {
    format!("{}/{}", name, group.source)
}

/// Per-provider consumer: one initial batch under a hard budget, then
/// ongoing updates until the provider stops or the cohort is
/// cancelled.
async fn consume_updates(
    set: Arc<TargetSet>,
    name: String,
    config: Arc<ScrapeConfig>,
    ctx: CancellationToken,
    mut updates: mpsc::Receiver<Vec<TargetGroup>>,
    initial_tx: oneshot::Sender<InitialEntries>,
) {
    let initial = tokio::select! {
        _ = ctx.cancelled() => {
            let _ = initial_tx.send(vec![]);
            return;
        }
        batch = updates.recv() => batch.unwrap_or_default(),
        _ = tokio::time::sleep(PROVIDER_INITIAL_TIMEOUT) => {
            // The initial set didn't arrive in time. Act as if it was
            // empty and pick the targets up through updates later on.
            vec![]
        }
    };

    let mut entries = vec![];
    for group in initial {
        match targets_from_group(&group, &config) {
            Ok(targets) => entries.push((composite_key(&name, &group), targets)),
            Err(err) => {
                error!(
                    message = "target update failed",
                    provider = %name,
                    target_group = %group.source,
                    %err,
                );
            }
        }
    }
    let _ = initial_tx.send(entries);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            batch = updates.recv() => match batch {
                Some(groups) => {
                    for group in groups {
                        if let Err(err) = set.update(&name, &group).await {
                            error!(
                                message = "target update failed",
                                provider = %name,
                                target_group = %group.source,
                                %err,
                            );
                        }
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::discovery::StaticProvider;
    use crate::labels::{LabelSet, ADDRESS_LABEL};
    use crate::sink::Sample;

    struct NullSink;

    impl SampleSink for NullSink {
        fn append(&self, _sample: Sample) {}
    }

    /// Forwards externally-fed batches, for driving update sequences
    /// from tests.
    struct ChannelProvider {
        rx: mpsc::Receiver<Vec<TargetGroup>>,
    }

    #[async_trait]
    impl Discoverer for ChannelProvider {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            out: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            let mut rx = self.rx;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    groups = rx.recv() => match groups {
                        Some(groups) => {
                            if out.send(groups).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Delays its initial (and only) batch.
    struct DelayedProvider {
        delay: Duration,
        groups: Vec<TargetGroup>,
    }

    #[async_trait]
    impl Discoverer for DelayedProvider {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            out: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(self.delay) => {}
            }

            let _ = out.send(self.groups).await;
        }
    }

    fn new_set() -> Arc<TargetSet> {
        let config: Arc<ScrapeConfig> =
            Arc::new(serde_yaml::from_str("job_name: test\nscrape_interval: 1h").unwrap());

        Arc::new(TargetSet::new(config, HttpClient::new(), Arc::new(NullSink)))
    }

    fn config_of(set: &Arc<TargetSet>) -> Arc<ScrapeConfig> {
        set.state.try_read().unwrap().config.clone()
    }

    fn group(source: &str, addresses: &[&str]) -> TargetGroup {
        TargetGroup {
            targets: addresses
                .iter()
                .map(|address| [(ADDRESS_LABEL, *address)].into_iter().collect())
                .collect(),
            labels: LabelSet::new(),
            source: source.to_string(),
        }
    }

    fn providers(provider: impl Discoverer) -> HashMap<String, Box<dyn Discoverer>> {
        HashMap::from([("test/0".to_string(), Box::new(provider) as Box<dyn Discoverer>)])
    }

    async fn wait_for_targets(
        set: &Arc<TargetSet>,
        predicate: impl Fn(&[Arc<Target>]) -> bool,
    ) -> Vec<Arc<Target>> {
        for _ in 0..600 {
            let targets = set.targets().await;
            if predicate(&targets) {
                return targets;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        panic!("timed out waiting for target state");
    }

    fn find<'a>(targets: &'a [Arc<Target>], address: &str) -> Option<&'a Arc<Target>> {
        targets.iter().find(|target| target.address() == address)
    }

    #[tokio::test(start_paused = true)]
    async fn initial_set_installed_without_throttle() {
        let set = new_set();
        let ctx = CancellationToken::new();

        let provider = StaticProvider::new(vec![group("", &["127.0.0.1:1"])]);
        set.clone()
            .run_providers(&ctx, config_of(&set), providers(provider))
            .await;

        // installed by run_providers itself, no run loop involved
        let targets = set.targets().await;
        assert_eq!(targets.len(), 1);
        assert!(targets[0].is_running());

        ctx.cancel();
        set.pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_then_catches_up() {
        let set = new_set();
        let ctx = CancellationToken::new();

        let provider = DelayedProvider {
            delay: Duration::from_secs(10),
            groups: vec![group("late", &["127.0.0.1:1"])],
        };

        set.clone()
            .run_providers(&ctx, config_of(&set), providers(provider))
            .await;

        // budget elapsed: the initial desired map is empty
        assert!(set.targets().await.is_empty());

        let handle = tokio::spawn(set.clone().run(ctx.clone()));

        // once the batch arrives, a throttled sync installs the target
        wait_for_targets(&set, |targets| targets.len() == 1).await;

        ctx.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_target_keeps_loop_identity() {
        let set = new_set();
        let ctx = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);

        tx.send(vec![group("g", &["127.0.0.1:1", "127.0.0.1:2"])])
            .await
            .unwrap();
        set.clone()
            .run_providers(&ctx, config_of(&set), providers(ChannelProvider { rx }))
            .await;
        let handle = tokio::spawn(set.clone().run(ctx.clone()));

        let targets = set.targets().await;
        let first_a = find(&targets, "127.0.0.1:1").unwrap().clone();
        let first_b = find(&targets, "127.0.0.1:2").unwrap().clone();

        // a flaps away
        tx.send(vec![group("g", &["127.0.0.1:2", "127.0.0.1:3"])])
            .await
            .unwrap();
        let targets = wait_for_targets(&set, |targets| {
            find(targets, "127.0.0.1:3").is_some() && find(targets, "127.0.0.1:1").is_none()
        })
        .await;
        let second_b = find(&targets, "127.0.0.1:2").unwrap().clone();
        let second_c = find(&targets, "127.0.0.1:3").unwrap().clone();
        assert!(Arc::ptr_eq(&first_b, &second_b));
        assert!(!first_a.is_running());

        // a comes back
        tx.send(vec![group(
            "g",
            &["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"],
        )])
        .await
        .unwrap();
        let targets = wait_for_targets(&set, |targets| targets.len() == 3).await;

        // b and c kept their scrape loops, a restarted fresh
        assert!(Arc::ptr_eq(&second_b, find(&targets, "127.0.0.1:2").unwrap()));
        assert!(Arc::ptr_eq(&second_c, find(&targets, "127.0.0.1:3").unwrap()));
        let third_a = find(&targets, "127.0.0.1:1").unwrap();
        assert!(!Arc::ptr_eq(&first_a, third_a));
        assert!(third_a.is_running());

        ctx.cancel();
        handle.await.unwrap();
        assert!(set.targets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_signal_coalesces() {
        let set = new_set();

        set.update("test/0", &group("a", &["127.0.0.1:1"]))
            .await
            .unwrap();
        set.update("test/0", &group("b", &["127.0.0.1:2"]))
            .await
            .unwrap();
        set.update("test/0", &group("c", &["127.0.0.1:3"]))
            .await
            .unwrap();

        // three updates, one pending signal
        let mut sync_rx = set.sync_rx.lock().await;
        assert!(sync_rx.try_recv().is_ok());
        assert!(sync_rx.try_recv().is_err());
        drop(sync_rx);

        // every update is staged regardless of the dropped signals
        let state = set.state.read().await;
        assert_eq!(state.tgroups.len(), 3);
        assert!(state.tgroups.contains_key("test/0/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_yields_latest_state() {
        let set = new_set();
        let ctx = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);

        tx.send(vec![group("g", &["127.0.0.1:1"])]).await.unwrap();
        set.clone()
            .run_providers(&ctx, config_of(&set), providers(ChannelProvider { rx }))
            .await;
        let handle = tokio::spawn(set.clone().run(ctx.clone()));

        // a burst within one throttle window: the final sync must
        // reflect the newest state
        tx.send(vec![group("g", &["127.0.0.1:2"])]).await.unwrap();
        tx.send(vec![group("g", &["127.0.0.1:3"])]).await.unwrap();

        wait_for_targets(&set, |targets| {
            targets.len() == 1 && targets[0].address() == "127.0.0.1:3"
        })
        .await;

        ctx.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_providers_replaces_cohort() {
        let set = new_set();
        let ctx = CancellationToken::new();

        let provider = StaticProvider::new(vec![group("", &["127.0.0.1:1"])]);
        set.clone()
            .run_providers(&ctx, config_of(&set), providers(provider))
            .await;
        let old = set.targets().await;
        assert_eq!(old.len(), 1);

        // second cohort discovers a different target set; the stale
        // desired entries must not survive
        let provider = StaticProvider::new(vec![group("", &["127.0.0.1:2"])]);
        set.clone()
            .run_providers(&ctx, config_of(&set), providers(provider))
            .await;

        let targets = set.targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address(), "127.0.0.1:2");
        assert!(!old[0].is_running());

        ctx.cancel();
        set.pool.stop().await;
    }
}
