use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use super::set::TargetSet;
use super::target::Target;
use crate::config::{Config, ScrapeConfig};
use crate::discovery::providers_from_config;
use crate::http::HttpClient;
use crate::sink::SampleSink;

/// Maintains the set of scraped targets: runs one [`TargetSet`] per
/// configured scrape job and starts and stops them as configuration
/// is applied. Cheap to clone; all clones share one manager.
#[derive(Clone)]
pub struct TargetManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: HttpClient,
    sink: Arc<dyn SampleSink>,
    state: RwLock<State>,
}

struct State {
    scrape_configs: Vec<Arc<ScrapeConfig>>,
    sets: HashMap<String, Arc<TargetSet>>,

    /// The base cancellation scope of the current run; present while
    /// running.
    ctx: Option<CancellationToken>,

    /// Resolves to `true` when the current run has fully wound down.
    run_done: Option<watch::Receiver<bool>>,
}

impl TargetManager {
    pub fn new(client: HttpClient, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                sink,
                state: RwLock::new(State {
                    scrape_configs: vec![],
                    sets: HashMap::new(),
                    ctx: None,
                    run_done: None,
                }),
            }),
        }
    }

    /// Run target discovery and scraping for the configured jobs.
    /// Blocks until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        info!(message = "starting target manager");

        let (handles, done_tx) = {
            let mut state = self.inner.state.write().await;

            let ctx = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            state.ctx = Some(ctx.clone());
            state.run_done = Some(done_rx);

            // Start new target sets and update existing ones.
            let mut jobs = HashSet::new();
            for config in state.scrape_configs.clone() {
                jobs.insert(config.job_name.clone());

                let set = state
                    .sets
                    .entry(config.job_name.clone())
                    .or_insert_with(|| {
                        Arc::new(TargetSet::new(
                            config.clone(),
                            self.inner.client.clone(),
                            self.inner.sink.clone(),
                        ))
                    })
                    .clone();

                set.run_providers(&ctx, config.clone(), providers_from_config(&config))
                    .await;
            }

            // Drop target sets whose job is gone.
            state.sets.retain(|job, _set| jobs.contains(job));

            // Run the reconciliation loops.
            let handles = state
                .sets
                .values()
                .map(|set| tokio::spawn(set.clone().run(ctx.clone())))
                .collect::<Vec<_>>();

            (handles, done_tx)
        };

        futures::future::join_all(handles).await;
        let _ = done_tx.send(true);
    }

    /// Stop all background processing and wait for every in-flight
    /// scrape write to finish. Must not be called twice for one run.
    pub async fn stop(&self) {
        info!(message = "stopping target manager");

        let (ctx, run_done) = {
            let mut state = self.inner.state.write().await;
            (state.ctx.take(), state.run_done.take())
        };

        // Cancelling the base scope shuts down all target providers
        // and reconciliation loops; started inserts are finished
        // before the loops exit.
        if let Some(ctx) = ctx {
            ctx.cancel();
        }

        if let Some(mut run_done) = run_done {
            let _ = run_done.wait_for(|finished| *finished).await;
        }

        debug!(message = "target manager stopped");
    }

    /// Replace the scrape configuration. If the manager is running it
    /// is stopped, reconfigured, and restarted on a background task;
    /// targets that are still valid under the new configuration come
    /// back through the regular reconciliation path. Returns true on
    /// success.
    pub async fn apply_config(&self, config: &Config) -> bool {
        let running = self.inner.state.read().await.ctx.is_some();

        if running {
            self.stop().await;
        }

        {
            let mut state = self.inner.state.write().await;
            state.scrape_configs = config
                .scrape_configs
                .iter()
                .cloned()
                .map(Arc::new)
                .collect();
        }

        if running {
            let manager = self.clone();
            tokio::spawn(async move { manager.run().await });
        }

        true
    }

    /// The currently-running targets, bucketed by their `job` label.
    /// The label usually equals the owning job's name but can diverge
    /// under relabeling; the public view honors the label.
    pub async fn pools(&self) -> HashMap<String, Vec<Arc<Target>>> {
        let state = self.inner.state.read().await;

        let mut pools: HashMap<String, Vec<Arc<Target>>> = HashMap::new();
        for set in state.sets.values() {
            for target in set.targets().await {
                pools
                    .entry(target.job().to_string())
                    .or_default()
                    .push(target);
            }
        }

        pools
    }
}
