use serde::{Deserialize, Serialize};

use crate::logging::log_level::LogLevel;

/// Output format for log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Pretty,
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: OutputFormat,
    /// Include the emitting module path in every line.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: OutputFormat::Pretty,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Create configuration from `LOG_LEVEL` / `LOG_FORMAT`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level_str) = std::env::var("LOG_LEVEL") {
            if let Ok(level) = level_str.parse::<LogLevel>() {
                config.level = level;
            }
        }

        if let Ok(format_str) = std::env::var("LOG_FORMAT") {
            if let Some(format) = Self::parse_format(&format_str) {
                config.format = format;
            }
        }

        config
    }

    pub fn parse_format(format: &str) -> Option<OutputFormat> {
        match format.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "pretty" => Some(OutputFormat::Pretty),
            "compact" | "text" => Some(OutputFormat::Compact),
            _ => None,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogConfig::parse_format("JSON"), Some(OutputFormat::Json));
        assert_eq!(LogConfig::parse_format("text"), Some(OutputFormat::Compact));
        assert_eq!(LogConfig::parse_format("xml"), None);
    }

    #[test]
    fn test_builder_methods() {
        let config = LogConfig::default()
            .with_level(LogLevel::Debug)
            .with_format(OutputFormat::Json);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, OutputFormat::Json);
    }
}
