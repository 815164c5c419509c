//! Process-wide logger bootstrap.

use std::sync::Once;

const LOG_ENV: &str = "IRONSEAL_LOG";

static INIT: Once = Once::new();

/// Initialise `env_logger` once. `IRONSEAL_LOG` wins over `RUST_LOG`, which
/// wins over `default_level`.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| default_level.to_string());

        let _ = env_logger::Builder::new()
            .parse_filters(&filter)
            .format_timestamp_secs()
            .try_init();
    });
}
