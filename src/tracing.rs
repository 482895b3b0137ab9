use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the process-wide tracing subscriber: pretty output to stderr, filtered by
/// `RUST_LOG` (defaulting to `info`), with noisy transport crates (`hyper`, `mio`,
/// `notify`) muted in the default filter.
pub fn init_tracer() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}
