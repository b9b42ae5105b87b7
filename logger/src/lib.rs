//! Logging for brume binaries and test runs.

use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;

type InstallError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the process-wide `tracing` subscriber. Binaries call this
/// once at startup; it panics if a subscriber is already set.
///
/// Events print to stdout at INFO and above. `RUST_LOG` overrides the
/// filtering with the usual directive syntax, e.g.
/// `RUST_LOG=brume_chain=debug,info`.
pub fn init() {
    install().expect("A global tracing subscriber is already set");
}

/// Best-effort install for tests: does nothing unless `RUST_LOG` is
/// set, and tolerates losing the install race against other test
/// threads.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = install();
    }
}

fn install() -> Result<(), InstallError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        // Colors only when someone is actually watching; keeps piped
        // and CI output clean.
        .with_ansi(std::io::stdout().is_terminal())
        .try_init()
}
