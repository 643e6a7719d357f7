//! Logging setup for Codoc binaries.
//!
//! Everything goes to stderr so log lines never interleave with a reply
//! streamed to stdout. HTTP and TLS internals are held at `warn` unless
//! `RUST_LOG` says otherwise.

use std::fmt;
use std::io::IsTerminal;
use std::str::FromStr;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Transport crates whose debug output carries no conversation context.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines, colored when stderr is a terminal.
    #[default]
    Pretty,
    /// One JSON object per event, with the conversation fields flattened.
    Json,
}

impl LogFormat {
    pub const VARIANTS: &'static [&'static str] = &["pretty", "json"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
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
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "expected one of {:?}, got '{other}'",
                Self::VARIANTS
            )),
        }
    }
}

/// Filter for the engine at `log_level`, with transport crates held at `warn`.
fn engine_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let directives = std::iter::once(log_level.to_string())
        .chain(NOISY_MODULES.iter().map(|module| format!("{module}=warn")))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Install the global subscriber.
///
/// An unknown `log_format` falls back to pretty output and says so once the
/// subscriber is live. A second call leaves the first subscriber in place.
pub fn init_logging(log_level: &str, log_format: &str) {
    let (format, rejected) = match log_format.parse::<LogFormat>() {
        Ok(format) => (format, None),
        Err(reason) => (LogFormat::default(), Some(reason)),
    };

    let registry = tracing_subscriber::registry().with(engine_filter(log_level));
    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if installed.is_err() {
        return;
    }
    if let Some(reason) = rejected {
        tracing::warn!(log_format = %log_format, %reason, "Unknown log format, using pretty");
    }
    tracing::debug!(log_level = %log_level, log_format = %format, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("pretty", LogFormat::Pretty ; "pretty")]
    #[test_case("JSON", LogFormat::Json ; "uppercase json")]
    #[test_case(" json ", LogFormat::Json ; "padded json")]
    fn test_log_format_parses(input: &str, expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>(), Ok(expected));
    }

    #[test]
    fn test_log_format_rejects_unknown() {
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("'xml'"));
        assert!(err.contains("json"));
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("info", "pretty");
        init_logging("debug", "xml");
    }
}
