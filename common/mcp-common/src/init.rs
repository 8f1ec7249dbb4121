//! Tracing initialization
//!
//! Logs always go to stderr: stdout carries NDJSON output for the CLI and the
//! protocol stream for stdio children.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map a `-v` count to a default level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize tracing/logging
///
/// Sets up logging to stderr with:
/// - Environment-based filtering via RUST_LOG
/// - A default directive for `crate_name` derived from `verbose`
///
/// Set `LOG_FORMAT=json` for structured JSON output (useful for production/log aggregation).
/// Default is human-readable text output.
///
/// # Example
///
/// ```rust,ignore
/// mcp_common::init_tracing("toolrelay", cli.verbose)?;
/// ```
pub fn init_tracing(crate_name: &str, verbose: u8) -> anyhow::Result<()> {
    let directive = format!("{}={}", crate_name, level_for_verbosity(verbose));
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}
