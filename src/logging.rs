//! Diagnostic logging setup
//!
//! `RUST_LOG` wins over the configured level. Output always goes to stderr.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. A second call is a no-op.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init("debug", false);
        init("warn", true);
        tracing::debug!("still logging after a second init");
    }
}
