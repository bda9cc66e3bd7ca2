// sessionvault/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Tracing subscriber already installed, keeping the existing one");
    }
}

/// Filter directive for a CLI verbosity count (`-v`, `-vv`).
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "sessionvault=info",
        1 => "sessionvault=debug",
        _ => "sessionvault=trace",
    }
}
