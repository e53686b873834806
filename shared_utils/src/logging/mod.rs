//! Logging module for tunneld.
//!
//! Structured logging built on `tracing`. Both the daemon and the client
//! tooling initialize their subscriber through [`init_logging`].

use std::path::PathBuf;
use tracing::{Level, Subscriber};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    /// Write to stderr
    pub stderr: bool,
    /// Also write daily-rolling files into this directory
    pub file_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// One JSON object per record instead of the human format
    pub json: bool,
    pub source_location: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            stderr: true,
            file_dir: None,
            file_prefix: "tunneld".to_string(),
            json: false,
            source_location: false,
        }
    }
}

/// Map a configured level name onto a [`Level`], falling back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn output_layer<S, W>(
    options: &LogOptions,
    writer: W,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(options.source_location)
        .with_line_number(options.source_location);
    if options.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber described by `options`.
///
/// Hold on to the returned guard while file output is enabled; dropping it
/// flushes and stops the background writer. A second call in the same
/// process leaves the first subscriber in place.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Dependencies that still emit through `log`
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let mut layers = Vec::new();

    if options.stderr {
        layers.push(output_layer(&options, std::io::stderr, true));
    }

    let guard = options.file_dir.as_ref().map(|dir| {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, &options.file_prefix);
        let (writer, guard) = NonBlocking::new(appender);
        layers.push(output_layer(&options, writer, false));
        guard
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize stderr logging at the level named in `config`.
pub fn init_logging_from_config(config: &crate::config::Config) -> Option<WorkerGuard> {
    init_logging(LogOptions {
        level: parse_level(&config.log_level),
        ..Default::default()
    })
}
