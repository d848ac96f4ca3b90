//! Logging setup for the switchyard binary
//!
//! Every long-lived task runs inside a span naming the service (`log`,
//! `replay`, `router`, `aggregator`, `worker`) so lines from concurrent
//! services stay attributable. Events carry structured fields: seq,
//! identity, correlation id, attempt.
//!
//! Console output is compact at `info` and below. At `debug` and `trace` it
//! adds module targets and runtime thread names, since tasks hop between
//! worker threads. JSON output keeps the current span as a field.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Keeps the non-blocking file writer alive; drop flushes it
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber for a service command
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);
    let filter = build_env_filter(level)?;

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(path) => {
            let (layer, guard) = build_file_layer(path, settings)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(build_console_layer(settings.json_format, level))
        .with(file_layer)
        .init();

    tracing::debug!(
        level = %level,
        file = ?settings.file,
        rotation = %settings.rotation,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// `-q` wins, then `-v`/`-vv`, then the configured level
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => parse_level(&settings.level),
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}

/// RUST_LOG drives other crates; the switchyard directive always applies
fn build_env_filter(level: Level) -> Result<EnvFilter> {
    let own: Directive = format!("switchyard={}", level.as_str().to_lowercase())
        .parse()
        .map_err(|e| Error::config_field_invalid("logging.level", format!("{}", e)))?;

    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(own))
}

fn build_console_layer<S>(json_format: bool, level: Level) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let detailed = level >= Level::DEBUG;

    if json_format {
        return Box::new(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(detailed)
                .with_thread_names(detailed),
        );
    }

    Box::new(
        fmt::layer()
            .compact()
            .with_target(detailed)
            .with_thread_names(detailed),
    )
}

/// Time-based rotation; tracing-appender has no size-based policy
fn parse_rotation(rotation: &str) -> Result<Rotation> {
    match rotation.to_lowercase().as_str() {
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        other => Err(Error::config_field_invalid(
            "logging.rotation",
            format!("unknown rotation '{}', expected hourly, daily or never", other),
        )),
    }
}

/// File layer that always records targets and threads, without colour
fn build_file_layer<S>(log_file: &str, settings: &LoggingSettings) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let prefix = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("switchyard");

    let appender = RollingFileAppender::builder()
        .rotation(parse_rotation(&settings.rotation)?)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(settings.max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::config_field_invalid("logging.file", format!("cannot open log file: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer: BoxedLayer<S> = if settings.json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_thread_names(true),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
    };

    Ok((layer, guard))
}

/// Warnings-only logging for `config` subcommands
///
/// Errors on a second call instead of panicking.
pub fn init_simple(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .with(fmt::layer().compact().with_target(false))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level_falls_back_to_info() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_flags_override_configured_level() {
        let settings = LoggingSettings {
            level: "error".to_string(),
            ..Default::default()
        };
        assert_eq!(determine_level(&settings, 0, false), Level::ERROR);
        assert_eq!(determine_level(&settings, 1, false), Level::DEBUG);
        assert_eq!(determine_level(&settings, 3, false), Level::TRACE);
        assert_eq!(determine_level(&settings, 2, true), Level::ERROR);
    }

    #[test]
    fn test_env_filter_builds_for_every_level() {
        for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
            assert!(build_env_filter(level).is_ok());
        }
    }

    #[test]
    fn test_rotation_names() {
        assert!(matches!(parse_rotation("Daily"), Ok(r) if r == Rotation::DAILY));
        assert!(matches!(parse_rotation("never"), Ok(r) if r == Rotation::NEVER));
        assert!(parse_rotation("weekly").is_err());
    }

    #[test]
    fn test_init_simple_twice_is_error_not_panic() {
        let _ = init_simple(Level::WARN);
        assert!(init_simple(Level::WARN).is_err());
    }

    #[test]
    fn test_file_layer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs").join("router.log");
        let settings = LoggingSettings {
            file: Some(log_path.to_string_lossy().into_owned()),
            rotation: "hourly".to_string(),
            ..Default::default()
        };

        let result = build_file_layer::<tracing_subscriber::Registry>(
            settings.file.as_deref().unwrap(),
            &settings,
        );
        assert!(result.is_ok());
        assert!(temp_dir.path().join("logs").exists());
    }

    #[test]
    fn test_file_layer_rejects_unknown_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let settings = LoggingSettings {
            rotation: "weekly".to_string(),
            ..Default::default()
        };
        let path = temp_dir.path().join("x.log");

        let result = build_file_layer::<tracing_subscriber::Registry>(path.to_str().unwrap(), &settings);
        assert!(matches!(result, Err(Error::ConfigValidation { .. })));
    }
}
