//! Runtime configuration for Steward services
//!
//! Configuration is read from the environment at the composition root and
//! passed explicitly into components; nothing reads the environment after
//! startup.

use crate::domain_types::{Confidence, TimeoutMs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors (startup exits with code 1 on these)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Operating mode for agents
///
/// `Demo` disables upstream adapters and sync workers and serves
/// deterministic fixtures; `Live` wires real source adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Demo,
    Live,
}

impl std::str::FromStr for AgentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "live" => Ok(Self::Live),
            other => Err(ConfigError::ValidationError {
                field: "AGENT_MODE".to_string(),
                reason: format!("expected 'demo' or 'live', got '{other}'"),
            }),
        }
    }
}

/// Complete Steward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardConfig {
    /// Operating mode (default demo)
    pub mode: AgentMode,
    /// Base URL of the local generation endpoint
    pub llm_base_url: String,
    /// Model identifier served by the local endpoint
    pub llm_model: String,
    /// Hard deadline for interpreter calls
    pub llm_timeout: TimeoutMs,
    /// Root directory for L3 cache and sync databases
    pub cache_dir: PathBuf,
    /// Optional remote key/value URL; absence disables L2
    pub cache_l2_url: Option<String>,
    /// Threshold below which interpretations fall back or fail
    pub min_confidence: Confidence,
    /// Base URL of the agent registry
    pub registry_url: String,
    /// Listen port for the gateway
    pub gateway_port: u16,
    /// Listen port for the coordinator
    pub coordinator_port: u16,
}

impl StewardConfig {
    /// Reads configuration from the environment, applying defaults
    ///
    /// Recognized keys: `AGENT_MODE`, `LLM_BASE_URL`, `LLM_MODEL`,
    /// `LLM_TIMEOUT_MS`, `CACHE_DIR`, `CACHE_L2_URL`, `MIN_CONFIDENCE`,
    /// `REGISTRY_URL`, `GATEWAY_PORT`, `COORDINATOR_PORT`.
    ///
    /// # Errors
    /// Returns `ConfigError` when a key is present but unparsable or out of
    /// range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match std::env::var("AGENT_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => AgentMode::Demo,
        };

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let llm_model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string());

        let llm_timeout = Self::parse_env("LLM_TIMEOUT_MS", 5000_u64, |raw| {
            TimeoutMs::try_new(raw).map_err(|e| e.to_string())
        })?;

        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let cache_l2_url = std::env::var("CACHE_L2_URL").ok().filter(|v| !v.is_empty());

        let min_confidence = Self::parse_env("MIN_CONFIDENCE", 0.7_f64, |raw| {
            Confidence::try_new(raw).map_err(|e| e.to_string())
        })?;

        let registry_url = std::env::var("REGISTRY_URL")
            .unwrap_or_else(|_| "http://localhost:9001".to_string());

        let gateway_port = Self::parse_port("GATEWAY_PORT", 9000)?;
        let coordinator_port = Self::parse_port("COORDINATOR_PORT", 9200)?;

        let config = Self {
            mode,
            llm_base_url,
            llm_model,
            llm_timeout,
            cache_dir,
            cache_l2_url,
            min_confidence,
            registry_url,
            gateway_port,
            coordinator_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration suitable for tests: demo mode, ephemeral
    /// cache directory, no L2, unreachable LLM.
    ///
    /// # Panics
    /// Panics if the hardcoded defaults are out of range for their domain
    /// types.
    pub fn testing(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: AgentMode::Demo,
            llm_base_url: "http://127.0.0.1:1".to_string(),
            llm_model: "test-model".to_string(),
            llm_timeout: TimeoutMs::try_new(250).unwrap(),
            cache_dir: cache_dir.into(),
            cache_l2_url: None,
            min_confidence: Confidence::try_new(0.7).unwrap(),
            registry_url: "http://127.0.0.1:1".to_string(),
            gateway_port: 0,
            coordinator_port: 0,
        }
    }

    /// Validates cross-field consistency
    ///
    /// # Errors
    /// Returns `ConfigError` when values are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.llm_base_url.starts_with("http://") && !self.llm_base_url.starts_with("https://") {
            return Err(ConfigError::ValidationError {
                field: "LLM_BASE_URL".to_string(),
                reason: "must be an http(s) URL".to_string(),
            });
        }

        if let Some(url) = &self.cache_l2_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError {
                    field: "CACHE_L2_URL".to_string(),
                    reason: "must be an http(s) URL".to_string(),
                });
            }
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError {
                field: "CACHE_DIR".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    fn parse_env<T, R>(
        key: &str,
        default: R,
        build: impl Fn(R) -> Result<T, String>,
    ) -> Result<T, ConfigError>
    where
        R: std::str::FromStr,
        R::Err: std::fmt::Display,
    {
        let raw = match std::env::var(key) {
            Ok(v) => v.parse::<R>().map_err(|e| ConfigError::ValidationError {
                field: key.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => default,
        };
        build(raw).map_err(|reason| ConfigError::ValidationError {
            field: key.to_string(),
            reason,
        })
    }

    fn parse_port(key: &str, default: u16) -> Result<u16, ConfigError> {
        match std::env::var(key) {
            Ok(v) => v.parse::<u16>().map_err(|e| ConfigError::ValidationError {
                field: key.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_config_is_valid() {
        let config = StewardConfig::testing("/tmp/steward-test");
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, AgentMode::Demo);
        assert!(config.cache_l2_url.is_none());
    }

    #[test]
    fn agent_mode_parses_case_insensitively() {
        assert_eq!("demo".parse::<AgentMode>().unwrap(), AgentMode::Demo);
        assert_eq!("LIVE".parse::<AgentMode>().unwrap(), AgentMode::Live);
        assert!("staging".parse::<AgentMode>().is_err());
    }

    #[test]
    fn validate_rejects_non_http_llm_url() {
        let mut config = StewardConfig::testing("/tmp/steward-test");
        config.llm_base_url = "localhost:11434".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_http_l2_url() {
        let mut config = StewardConfig::testing("/tmp/steward-test");
        config.cache_l2_url = Some("redis://localhost".to_string());
        assert!(config.validate().is_err());
    }
}
