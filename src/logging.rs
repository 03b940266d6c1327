//! Logging setup for the binary and for tests that want output.

use tracing_subscriber::EnvFilter;

/// Default filter directive for a verbosity level (`-v` count)
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber, writing `[LEVEL file:line] message` lines
/// to stderr.
///
/// `RUST_LOG` overrides the level implied by `verbosity`. Calling this more
/// than once keeps the first subscriber.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .without_time()
        .try_init();
}
