//! Process-wide tracing setup for host applications.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "buslease=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(DEFAULT_FILTER);
        init("debug");
        tracing::info!("still logging after repeated init");
    }
}
