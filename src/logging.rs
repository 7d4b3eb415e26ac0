//! Logging configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-frame events.
    Trace,
    /// Lifecycle details.
    Debug,
    /// Open/close and acquisition start/stop.
    #[default]
    Info,
    /// Recoverable failures.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Directive string understood by [`EnvFilter`].
    pub const fn to_filter_string(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(Error::BadParameter(format!("invalid log level: {s}"))),
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Level used when `RUST_LOG` is not set.
    pub log_level: LogLevel,
    /// Emit JSON lines instead of human-readable output.
    pub json_format: bool,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `options.log_level`.
///
/// # Errors
///
/// Returns `InvalidCall` if a global subscriber is already installed.
pub fn init_logging(options: &LogOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.to_filter_string()));

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = if options.json_format {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber.with(fmt::layer()).try_init()
    };
    installed.map_err(|err| Error::InvalidCall(format!("logging already initialised: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_filter_strings() {
        assert_eq!(LogLevel::default().to_filter_string(), "info");
        assert_eq!(LogLevel::Trace.to_filter_string(), "trace");
    }
}
