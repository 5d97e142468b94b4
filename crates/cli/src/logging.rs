use tracing_subscriber::EnvFilter;

/// Initialise logging with tracing-subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` applies.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
