//! Log output for the Omnicast binaries
//!
//! Everything goes to stderr so stdout stays free for command results.
//! `RUST_LOG` overrides the level chosen here.
//!
//! ```no_run
//! use libomnicast::logging::{LogFormat, LogSettings};
//!
//! LogSettings::from_env().with_format(LogFormat::Json).init();
//! ```

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const FORMAT_VAR: &str = "OMNICAST_LOG_FORMAT";
const LEVEL_VAR: &str = "OMNICAST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain lines without target, for journald and pipes
    Text,
    /// One flattened JSON object per event
    Json,
    /// Multi-line colored output
    Pretty,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogFormat::Text, LogFormat::Json, LogFormat::Pretty]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log format '{}', expected text, json or pretty", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `info` or `libomnicast::queue=debug`
    pub directives: String,
}

impl LogSettings {
    /// Text at `info`, unless `OMNICAST_LOG_FORMAT` or `OMNICAST_LOG_LEVEL` say otherwise
    pub fn from_env() -> Self {
        let format = std::env::var(FORMAT_VAR)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(LogFormat::Text);
        let directives = std::env::var(LEVEL_VAR)
            .ok()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self { format, directives }
    }

    /// Errors only, for commands whose output is their result
    pub fn quiet() -> Self {
        Self {
            format: LogFormat::Text,
            directives: "error".to_string(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Raise everything to `debug`
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.directives = "debug".to_string();
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.directives))
    }

    /// Install the global subscriber
    ///
    /// Returns false if one was already installed, which happens when tests
    /// share a process.
    pub fn init(&self) -> bool {
        let output = match self.format {
            LogFormat::Json => tracing_fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Pretty => tracing_fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Text => tracing_fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .boxed(),
        };

        tracing_subscriber::registry()
            .with(output)
            .with(self.filter())
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(FORMAT_VAR);
        std::env::remove_var(LEVEL_VAR);
    }

    #[test]
    fn test_format_parsing_ignores_case() {
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("'xml'"));
        assert_eq!(LogFormat::Text.to_string(), "text");
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        std::env::set_var(FORMAT_VAR, "json");
        std::env::set_var(LEVEL_VAR, "libomnicast::queue=trace");
        let settings = LogSettings::from_env();
        clear_env();

        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.directives, "libomnicast::queue=trace");
    }

    #[test]
    #[serial]
    fn test_unparseable_env_falls_back_to_defaults() {
        std::env::set_var(FORMAT_VAR, "xml");
        std::env::set_var(LEVEL_VAR, "  ");
        let settings = LogSettings::from_env();
        clear_env();

        assert_eq!(settings.format, LogFormat::Text);
        assert_eq!(settings.directives, "info");
    }

    #[test]
    fn test_verbose_overrides_quiet() {
        assert_eq!(LogSettings::quiet().verbose(false).directives, "error");
        let settings = LogSettings::quiet().verbose(true).with_format(LogFormat::Pretty);
        assert_eq!(settings.directives, "debug");
        assert_eq!(settings.format, LogFormat::Pretty);
    }
}
