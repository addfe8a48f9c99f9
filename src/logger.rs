//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr; `RUST_LOG`
/// overrides the verbosity chosen on the command line.
pub fn init(verbose: bool) {
    let default = if verbose { "ecpipe=debug" } else { "ecpipe=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be installed (tests, embedding); keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
