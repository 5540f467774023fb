//! Tracing setup

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber from `RUST_LOG` plus the default
/// `offline_shell=info` directive. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::from_default_env().add_directive(
        "offline_shell=info"
            .parse()
            .unwrap_or_else(|_| LevelFilter::INFO.into()),
    );

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
