//! `tracing-subscriber` setup for the binary.

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "APPRAISER_LOG";
const LOG_FORMAT_ENV: &str = "APPRAISER_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per event.
    Json,
    Compact,
}

impl LogFormat {
    pub fn from_arg(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" => Some(Self::Human),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// `APPRAISER_LOG_FORMAT`, if set and recognised.
pub fn format_from_env() -> Option<LogFormat> {
    std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|v| LogFormat::from_arg(&v))
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("ensemble_appraiser={level},appraiser={level}")))
}

/// Install the global subscriber on stderr. A second call is a no-op.
pub fn init(level: &str, format: LogFormat) {
    let format = format_from_env().unwrap_or(format);
    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(level))
                .json()
                .with_writer(std::io::stderr)
                .try_init()
                .ok();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(level))
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .try_init()
                .ok();
        }
        LogFormat::Human => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(level))
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!(LogFormat::from_arg("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_arg(" compact "), Some(LogFormat::Compact));
        assert_eq!(LogFormat::from_arg("xml"), None);
    }
}
