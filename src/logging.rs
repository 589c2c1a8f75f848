#![forbid(unsafe_code)]

//! `tracing` subscriber setup shared by the server binary.
//!
//! The filter comes from `RUST_LOG` and falls back to [`DEFAULT_FILTER`].
//! Setting `MEDIAFETCH_LOG_FORMAT=json` switches to one JSON object per line,
//! which is what log shippers in front of the service expect.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,mediafetch=debug,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("MEDIAFETCH_LOG_FORMAT")
            .ok()
            .as_deref()
            .and_then(Self::parse)
            .unwrap_or_default()
    }
}

pub fn init_logging(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow!("installing tracing subscriber: {err}"))?;

    tracing::debug!(?format, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" text "), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
