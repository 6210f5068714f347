//! Agent manifests: the self-description every agent advertises
//!
//! A manifest names the agent, its capabilities with their schemas, the
//! data scopes and tools it touches, and how to probe its health. Core
//! agents are local-first: their `egress_domains` must be empty, which the
//! registry enforces at registration time.

use crate::domain_types::{AgentId, CapabilityVerb};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A schema-described operation exposed by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// The verb, `domain.action`
    pub verb: CapabilityVerb,
    /// One-line description (also shown to the interpreter)
    pub description: String,
    /// JSON-schema-like input descriptor
    pub input_schema: Value,
    /// JSON-schema-like output descriptor
    pub output_schema: Value,
    /// Safety notes surfaced to operators and policy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_annotations: Vec<String>,
}

/// How the registry should probe this agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe path, relative to the agent base URL
    pub endpoint: String,
    /// Seconds between probes
    pub interval_seconds: u64,
    /// Per-probe timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 5,
        }
    }
}

/// An agent's advertised self-description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Unique agent identifier within a registry
    pub agent_id: AgentId,
    /// Semantic version of the agent
    pub version: String,
    /// Human-readable name
    pub display_name: String,
    /// What the agent does
    pub description: String,
    /// Advertised capabilities
    pub capabilities: Vec<Capability>,
    /// Data the agent reads (e.g. `mail:inbox`)
    #[serde(default)]
    pub data_scopes: Vec<String>,
    /// Tools the agent may invoke
    #[serde(default)]
    pub tool_access: Vec<String>,
    /// Outbound domains; must be empty for core agents
    #[serde(default)]
    pub egress_domains: Vec<String>,
    /// Liveness probe configuration
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl AgentManifest {
    /// Whether this manifest advertises `verb`
    pub fn advertises(&self, verb: &CapabilityVerb) -> bool {
        self.capabilities.iter().any(|c| &c.verb == verb)
    }
}

/// A registration submitted to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// The agent's manifest
    pub manifest: AgentManifest,
    /// Base URL of the agent's HTTP surface
    pub base_url: String,
    /// Absolute health probe URL
    pub health_endpoint: String,
}

/// Liveness standing of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, not yet probed
    Registered,
    /// Probes succeeding
    Healthy,
    /// Probes succeeding but the agent reports degraded service
    Degraded,
    /// Consecutive probe failures past the unhealthy threshold
    Unhealthy,
    /// Probe failures past the unreachable threshold, or stale heartbeat
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> AgentManifest {
        AgentManifest {
            agent_id: AgentId::try_new("mail-agent".to_string()).unwrap(),
            version: "1.0.0".to_string(),
            display_name: "Mail Agent".to_string(),
            description: "Searches and reads locally synced mail".to_string(),
            capabilities: vec![Capability {
                verb: CapabilityVerb::try_new("mail.search".to_string()).unwrap(),
                description: "Search cached mail".to_string(),
                input_schema: json!({"type": "object"}),
                output_schema: json!({"type": "object"}),
                safety_annotations: vec![],
            }],
            data_scopes: vec!["mail:inbox".to_string()],
            tool_access: vec![],
            egress_domains: vec![],
            health_check: HealthCheckConfig::default(),
        }
    }

    #[test]
    fn advertises_matches_on_verb() {
        let m = manifest();
        let search = CapabilityVerb::try_new("mail.search".to_string()).unwrap();
        let read = CapabilityVerb::try_new("mail.read".to_string()).unwrap();
        assert!(m.advertises(&search));
        assert!(!m.advertises(&read));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let m = manifest();
        let raw = serde_json::to_string(&m).unwrap();
        let back: AgentManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.agent_id, m.agent_id);
        assert_eq!(back.capabilities.len(), 1);
        assert_eq!(back.health_check.interval_seconds, 30);
    }

    #[test]
    fn status_serializes_snake_case() {
        let raw = serde_json::to_value(AgentStatus::Unreachable).unwrap();
        assert_eq!(raw, "unreachable");
    }
}
