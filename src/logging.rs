//! Tracing subscriber setup for hosts that embed the engine.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "gallery_sync=info";

/// Install a fmt subscriber. `RUST_LOG` wins over `default_directive`.
/// Returns false if a global subscriber was already installed.
pub fn init(default_directive: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.unwrap_or(DEFAULT_DIRECTIVE)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
