//! Tracing setup for the CLI.
//!
//! Logs go to stderr so that `--json` output on stdout stays parseable.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init_logging(debug: bool) {
    INIT.call_once(|| {
        let default = if debug { "warn,mcpreg=debug" } else { "warn,mcpreg=info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(debug)
                .with_line_number(debug),
        );

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("[mcpreg] Failed to set tracing subscriber: {}", e);
        }
    });
}
