//! Logging configuration for the Transport Services runtime.
//!
//! The library logs through `tracing`. `initialize` installs a process-wide
//! subscriber with two reloadable pieces: the console level filter (driven
//! by [`set_log_level`]) and a growable set of file sinks (driven by
//! [`add_log_file`], built on non-blocking `tracing-appender` writers).
//! Console output colorizes whole lines by severity.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use colored::Colorize;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::error::{Result, TapsError};

/// Severity levels exposed by the public logging surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// A custom tracing event formatter colorizing output by level.
///
/// The entire line is colored according to severity, without timestamps or
/// level prefixes, to keep console output clean for interactive use.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields so color applies to the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

type FileLayers = Vec<Box<dyn Layer<Registry> + Send + Sync>>;
type WithFiles = Layered<reload::Layer<FileLayers, Registry>, Registry>;

struct Handles {
    level: reload::Handle<LevelFilter, WithFiles>,
    files: reload::Handle<FileLayers, Registry>,
    // Guards must live as long as the process or file logging stops.
    guards: Mutex<Vec<WorkerGuard>>,
}

static HANDLES: OnceLock<Handles> = OnceLock::new();

/// Install the subscriber. Idempotent; later calls are no-ops, and an
/// already-installed foreign subscriber (e.g. in test harnesses) is left
/// in place.
pub(crate) fn init() {
    if HANDLES.get().is_some() {
        return;
    }

    let (files_layer, files_handle): (
        reload::Layer<FileLayers, Registry>,
        reload::Handle<FileLayers, Registry>,
    ) = reload::Layer::new(FileLayers::new());

    let (level_filter, level_handle): (
        reload::Layer<LevelFilter, WithFiles>,
        reload::Handle<LevelFilter, WithFiles>,
    ) = reload::Layer::new(LevelFilter::INFO);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stdout)
        .with_filter(level_filter);

    let _ = tracing_subscriber::registry()
        .with(files_layer)
        .with(stdout_layer)
        .try_init();

    let _ = HANDLES.set(Handles {
        level: level_handle,
        files: files_handle,
        guards: Mutex::new(Vec::new()),
    });
}

/// Change the console log level at runtime.
pub fn set_log_level(level: LogLevel) -> Result<()> {
    let handles = HANDLES.get().ok_or(TapsError::NotInitialized)?;
    handles
        .level
        .reload(LevelFilter::from(level))
        .map_err(|_| TapsError::InvalidArgument("logging subscriber is no longer installed"))?;
    Ok(())
}

/// Append a log file sink receiving events at `min_level` and above.
///
/// The sink appends to the exact path given and writes through a
/// non-blocking worker; multiple files may be added.
pub fn add_log_file(path: &Path, min_level: LogLevel) -> Result<()> {
    let handles = HANDLES.get().ok_or(TapsError::NotInitialized)?;

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or(TapsError::InvalidArgument("log file path has no file name"))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::from(min_level))
        .boxed();

    handles
        .files
        .modify(|layers| layers.push(layer))
        .map_err(|_| TapsError::InvalidArgument("logging subscriber is no longer installed"))?;
    handles.guards.lock().expect("logging guard lock").push(guard);
    Ok(())
}
