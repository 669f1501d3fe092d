use std::path::PathBuf;
use std::sync::Arc;

use argh::FromArgs;
use scout::config;
use scout::http::HttpClient;
use scout::scrape::TargetManager;
use scout::signal::{self, SignalTo};
use scout::sink::LogSink;
use tracing::{error, info};

/// Scrape dynamically discovered targets and append their samples to
/// a sink.
#[derive(FromArgs)]
struct Opts {
    /// read configuration from one or more files
    #[argh(option, short = 'c')]
    config: Vec<PathBuf>,

    /// log level, e.g. "info" or "debug"
    #[argh(option, default = "String::from(\"info\")")]
    log_level: String,

    /// number of worker threads, defaults to the number of CPUs
    #[argh(option)]
    threads: Option<usize>,

    /// print version information
    #[argh(switch)]
    version: bool,
}

const CONFIG_ERROR_EXIT_CODE: i32 = 78;

fn main() {
    let opts: Opts = argh::from_env();

    if opts.version {
        println!("scout {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("scout-worker")
        .enable_io()
        .enable_time()
        .build()
        .expect("building the runtime should not fail");

    let levels =
        std::env::var("SCOUT_LOG").unwrap_or_else(|_err| format!("scout={}", opts.log_level));

    runtime.block_on(async move {
        scout::trace::init(true, &levels);

        if opts.config.is_empty() {
            error!(message = "no configuration file given, use --config");
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }

        let config = match config::load(&opts.config) {
            Ok(config) => config,
            Err(err) => {
                error!(message = "loading configuration failed", %err);
                std::process::exit(CONFIG_ERROR_EXIT_CODE);
            }
        };

        let mut signals = match signal::os_signals() {
            Ok(signals) => signals,
            Err(err) => {
                error!(message = "installing signal handlers failed", %err);
                std::process::exit(1);
            }
        };

        let manager = TargetManager::new(HttpClient::new(), Arc::new(LogSink));
        manager.apply_config(&config).await;

        let background = manager.clone();
        tokio::spawn(async move { background.run().await });

        while let Some(signal) = signals.recv().await {
            match signal {
                SignalTo::ReloadFromDisk => match config::load(&opts.config) {
                    Ok(config) => {
                        info!(message = "reloading configuration");
                        manager.apply_config(&config).await;
                    }
                    Err(err) => {
                        error!(message = "reloading configuration failed", %err);
                    }
                },
                SignalTo::Shutdown => {
                    manager.stop().await;
                    break;
                }
                SignalTo::Quit => break,
            }
        }
    });
}
