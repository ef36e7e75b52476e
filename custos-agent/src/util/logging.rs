use tracing_subscriber::{fmt, EnvFilter};

/// Initialize global tracing. `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = fmt().with_env_filter(filter).try_init();
}
