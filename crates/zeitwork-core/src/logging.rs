use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact output (interactive CLI use).
    Human,
    /// Structured JSON output (daemon mode).
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG` for filtering.
/// Default filter: info+ from zeitwork crates, warnings from dependencies.
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("zeitwork=info,warn"));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Human, LogFormat::Human);
        assert_ne!(LogFormat::Human, LogFormat::Json);
    }
}
