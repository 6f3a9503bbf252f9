//! Tracing subscriber setup for the client and server binaries.
//!
//! Events go to stderr by default, or to the file named by `--log`. Either
//! way the writer is non-blocking; the returned guard flushes it on drop.

use std::io::IsTerminal;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{Error, Result};

/// Crates whose debug output drowns the tunnel's own events.
const QUIET_TARGETS: &[&str] = &[
    "quinn=warn",
    "quinn_proto=warn",
    "quinn_udp=warn",
    "rustls=warn",
    "hyper=warn",
];

/// Build the env filter: `RUST_LOG` if set, `info` otherwise, with the
/// transport internals capped at `warn`.
fn build_filter() -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for target in QUIET_TARGETS {
        let directive = target
            .parse::<Directive>()
            .map_err(|e| Error::Logging(format!("bad directive {target}: {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Initialise the global tracing subscriber.
///
/// Returns a [`WorkerGuard`] that must be held for the lifetime of the
/// program; dropping it flushes the writer.
pub fn init_logging(log_file: Option<&Path>) -> Result<WorkerGuard> {
    let filter = build_filter()?;

    let (writer, guard, ansi) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| Error::Logging(format!("invalid log path {}", path.display())))?;
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, false)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, std::io::stderr().is_terminal())
        }
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    Ok(guard)
}
