//! Log output for the `gr3d-ci` binary.
//!
//! Verbosity is scoped: `--verbose` raises `gr3d_ci` and `gr3d_ci_cli` to
//! debug while reqwest, zip and the other dependencies stay at warn.
//! `RUST_LOG`, when set, replaces that scoping entirely. Per-target log lines
//! carry the `target{triple=...}` span opened by the pipeline, so concurrent
//! targets stay distinguishable in one interleaved log.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives for `level` when `RUST_LOG` is unset.
pub fn default_filter(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("warn,gr3d_ci={level},gr3d_ci_cli={level}")
}

/// Install the global subscriber: JSON lines when `json`, plain text
/// otherwise. Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    // Exactly one formatter is installed.
    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().with_target(false).json()), None)
    } else {
        (None, Some(fmt::layer().with_target(false)))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}
