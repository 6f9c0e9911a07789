//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};

/// Global configuration for the policy core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Accounting enforcement switches.
    #[serde(default)]
    pub enforce: EnforceConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a configuration document from JSON.
    pub fn from_json(raw: &str) -> crate::types::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| crate::types::Error::validation(format!("bad config: {err}")))
    }
}

/// Accounting enforcement switches.
///
/// `associations` requires every job to carry a valid association;
/// `limits` turns on the whole limit subsystem; `safe` additionally
/// requires a starting job to fit within the remaining historical
/// CPU-minute budget (and disables runtime timeout enforcement).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EnforceConfig {
    #[serde(default)]
    pub associations: bool,

    #[serde(default)]
    pub limits: bool,

    #[serde(default)]
    pub safe: bool,
}

impl EnforceConfig {
    /// Any enforcement at all configured.
    pub fn any(self) -> bool {
        self.associations || self.limits || self.safe
    }

    /// Associations plus the limit subsystem.
    pub fn limits() -> Self {
        Self {
            associations: true,
            limits: true,
            safe: false,
        }
    }

    /// Limits plus the safe (finish-within-budget) flavor.
    pub fn safe() -> Self {
        Self {
            associations: true,
            limits: true,
            safe: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config = Config::from_json(r#"{"enforce": {"limits": true, "safe": true}}"#).unwrap();
        assert!(config.enforce.limits);
        assert!(config.enforce.safe);
        assert!(!config.enforce.associations);
        assert_eq!(config.observability.log_level, "info");

        assert!(Config::from_json("{not json").is_err());
    }

    #[test]
    fn test_enforce_presets() {
        let none = EnforceConfig::default();
        assert!(!none.any());

        let limits = EnforceConfig::limits();
        assert!(limits.any());
        assert!(limits.limits);
        assert!(!limits.safe);

        let safe = EnforceConfig::safe();
        assert!(safe.limits);
        assert!(safe.safe);
    }
}
