//! Logging setup shared by the lm-universal binaries and benchmarks
//!
//! The library itself only emits `tracing` events; installing a subscriber is left to
//! executables, which call [`init_logger`] once at start-up.

use tracing::Level;

/// Install the timestamped tracing subscriber at INFO level
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module]` for INFO/WARN/ERROR
///         `[LEVEL YYYY-MM-DD HH:MM:SS file:line]` for DEBUG/TRACE
///
/// # Example
/// ```no_run
/// use lm_universal::init_logger;
///
/// init_logger();
/// tracing::info!("Application started");
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo run --bin optimize_homography
/// RUST_LOG=lm_universal=trace cargo run --bin optimize_plane
/// ```
pub fn init_logger() -> bool {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Returns `false` when a global subscriber was already installed, for example by an
/// earlier call from another benchmark group.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
///
/// # Example
/// ```no_run
/// use lm_universal::init_logger_with_level;
/// use tracing::Level;
///
/// // DEBUG also prints the per-iteration table of every optimization
/// init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_level(false)
        .with_thread_ids(false)
        .event_format(BracketFormatter)
        .try_init()
        .is_ok()
}

/// Formats events as `[LEVEL timestamp location] message`
struct BracketFormatter;

/// ANSI colored level label.
fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

/// `file:line` for DEBUG/TRACE events, the module path without crate prefix otherwise.
fn event_location(metadata: &tracing::Metadata<'_>) -> String {
    let verbose = *metadata.level() == Level::DEBUG || *metadata.level() == Level::TRACE;
    match (verbose, metadata.file()) {
        (true, Some(file)) => {
            let filename = file.rsplit('/').next().unwrap_or(file);
            match metadata.line() {
                Some(line) => format!("{filename}:{line}"),
                None => filename.to_string(),
            }
        }
        _ => {
            let target = metadata.target();
            target
                .strip_prefix("lm_universal::")
                .unwrap_or(target)
                .to_string()
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        write!(
            writer,
            "[{} {} {}] ",
            level_label(metadata.level()),
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            event_location(metadata)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
