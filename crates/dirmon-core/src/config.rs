//! Settings consumed by the core, read once at startup.

use crate::telemetry::{LoggingPolicy, SourcePolicy, default_environment};

/// Default API address when none is configured.
pub const DEFAULT_API_URL: &str = "http://localhost:8800";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base address of the directory API.
    pub api_url: String,
    /// Master switch for error reporting. Off unless explicitly enabled.
    pub telemetry_enabled: bool,
    /// Per-source switches, all on by default.
    pub sources: SourcePolicy,
    /// Environment string stamped on every error entry.
    pub environment: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            telemetry_enabled: false,
            sources: SourcePolicy::default(),
            environment: default_environment(),
        }
    }
}

impl Settings {
    pub fn logging_policy(&self) -> LoggingPolicy {
        LoggingPolicy {
            enabled: self.telemetry_enabled,
            sources: self.sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ErrorSource;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.api_url, "http://localhost:8800");
        assert!(!settings.telemetry_enabled);
        assert!(settings.environment.starts_with("dirmon/"));

        let policy = settings.logging_policy();
        for source in ErrorSource::ALL {
            assert!(policy.sources.get(source));
            assert!(!policy.is_enabled(source));
        }
    }
}
