use tracing_subscriber::filter::EnvFilter;

/// Initialize the global tracing subscriber. `levels` is an env-filter
/// expression, e.g. `info` or `scout=debug`.
pub fn init(color: bool, levels: &str) {
    let filter = EnvFilter::try_new(levels).unwrap_or_else(|_err| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_target(false)
        .init();
}
