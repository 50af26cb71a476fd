//! Log subscriber installation
//!
//! - `RUST_LOG` overrides the default `info` filter
//! - JSON output is one event per line, for log shippers
//! - Human output is the default for interactive use
//! - Everything goes to stderr; stdout is reserved for command output

use tracing_subscriber::EnvFilter;

/// Output format of the process-wide subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed (tests, embedding).
pub fn init(format: LogFormat, default_level: &str) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flag() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Text);
    }

    #[test]
    fn test_second_init_is_rejected() {
        init(LogFormat::Text, "info");
        assert!(!init(LogFormat::Json, "debug"));
    }
}
