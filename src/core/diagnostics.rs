//! Diagnostic reporting setup: color-eyre panic/error reports plus a
//! tracing subscriber for per-pass logging.

use color_eyre::Report;

/// Installs the error/panic report handler and the global tracing
/// subscriber. Call once at process start; calling twice is an error from
/// the underlying installers.
pub fn diagnostics_setup() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();
    Ok(())
}

/// Disables ANSI coloring of IR dumps, for tests and non-tty output.
pub fn diagnostics_color_disable() {
    yansi::Paint::disable();
}
