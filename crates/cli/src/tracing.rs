//! Tracing configuration for the buildstash CLI

use buildstash_core::config::DebugLog;
use std::io;
pub use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracing output format options
#[derive(Debug, Clone, clap::ValueEnum)]
pub enum TracingFormat {
    /// Pretty-printed human-readable format
    Pretty,
    /// Structured JSON format
    Json,
}

/// Log level options for the CLI
#[derive(Debug, Clone, clap::ValueEnum)]
pub enum LogLevel {
    /// Show all logs (trace level)
    Trace,
    /// Show debug and above
    Debug,
    /// Show info and above
    Info,
    /// Show warnings and above (default)
    Warn,
    /// Show errors only
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    pub level: Level,
    /// Components whose request logging is raised to debug
    pub debug_log: DebugLog,
}

/// Build the filter directive string for the given base level and component
/// toggles.
fn filter_directives(level: Level, debug_log: DebugLog) -> String {
    let level_str = match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    };
    let mut directives = vec![
        format!("buildstash_cli={level_str}"),
        format!("buildstash_core={level_str}"),
        format!("buildstash_store={level_str}"),
        format!("buildstash_certs={level_str}"),
        format!("buildstash_action={level_str}"),
        format!("buildstash_modproxy={level_str}"),
        format!("buildstash_revproxy={level_str}"),
    ];
    if debug_log.buildcache {
        directives.push("buildstash_action=debug".into());
    }
    if debug_log.modproxy {
        directives.push("buildstash_modproxy=debug".into());
    }
    if debug_log.revproxy {
        directives.push("buildstash_revproxy=debug".into());
    }
    directives.join(",")
}

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` overrides the CLI-derived filter entirely.
pub fn init_tracing(config: TracingConfig) -> miette::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(config.level, config.debug_log)))
        .map_err(|e| miette::miette!("Failed to create tracing filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        TracingFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(true);
            registry
                .with(layer)
                .try_init()
                .map_err(|e| miette::miette!("Failed to initialize tracing: {e}"))?;
        }
        TracingFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_current_span(false);
            registry
                .with(layer)
                .try_init()
                .map_err(|e| miette::miette!("Failed to initialize tracing: {e}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_base_level() {
        let directives = filter_directives(Level::INFO, DebugLog::default());
        assert!(directives.contains("buildstash_action=info"));
        assert!(!directives.contains("=debug"));
    }

    #[test]
    fn test_debug_log_raises_component() {
        let debug_log = DebugLog::parse("revproxy").unwrap();
        let directives = filter_directives(Level::WARN, debug_log);
        assert!(directives.contains("buildstash_revproxy=debug"));
        assert!(directives.contains("buildstash_action=warn"));
    }

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }
}
