//! Tracing subscriber setup shared by the binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `default_directive`. Calling this twice is harmless:
/// the second registration is ignored.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Directive string for a binary: `<crate>=<level>,erq_common=<level>`
pub fn directive_for(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level},erq_common={level}")
}
