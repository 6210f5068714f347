//! Agent registry
//!
//! Tracks live agents and their manifests, probes liveness on each
//! manifest's schedule, and aggregates per-agent health into a system-wide
//! dashboard. Lookups are concurrent-map reads; capability discovery scans
//! manifests so a registered agent is discoverable for every verb it
//! advertises, regardless of current health.

pub mod client;
pub mod http;

pub use client::{RegistryClient, RemoteAgent};

use crate::domain_types::{AgentId, CapabilityVerb};
use crate::error::{Error, Result};
use crate::manifest::{AgentRegistration, AgentStatus};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Liveness thresholds
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive probe failures before `unhealthy`
    pub consecutive_unhealthy_threshold: u32,
    /// Consecutive probe failures before `unreachable`
    pub consecutive_unreachable_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            consecutive_unhealthy_threshold: 3,
            consecutive_unreachable_threshold: 10,
        }
    }
}

/// A registered agent with its liveness bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAgent {
    /// The submitted registration
    pub registration: AgentRegistration,
    /// Registration time, unix milliseconds
    pub registered_at_ms: i64,
    /// Last successful probe, unix milliseconds
    pub last_heartbeat_at_ms: Option<i64>,
    /// Current liveness standing
    pub status: AgentStatus,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    #[serde(skip)]
    last_probe_at_ms: i64,
}

/// Simple counts for `/system/health`
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// `healthy` when every agent is healthy, `degraded` otherwise
    pub status: String,
    /// Registered agents
    pub total_agents: usize,
    /// Agents currently healthy
    pub healthy: usize,
    /// Agents degraded
    pub degraded: usize,
    /// Agents unhealthy
    pub unhealthy: usize,
    /// Agents unreachable
    pub unreachable: usize,
}

/// The registry service
pub struct AgentRegistry {
    agents: DashMap<AgentId, RegisteredAgent>,
    config: RegistryConfig,
    http: reqwest::Client,
    cancel: CancellationToken,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRegistry {
    /// Creates an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            agents: DashMap::new(),
            config,
            http: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            prober: Mutex::new(None),
        }
    }

    /// Registers an agent
    ///
    /// # Errors
    /// Returns `bad_request` when the manifest declares egress domains
    /// (core agents are local-first) and `conflict` for a duplicate
    /// `agent_id`.
    pub fn register(&self, registration: AgentRegistration) -> Result<()> {
        if !registration.manifest.egress_domains.is_empty() {
            return Err(Error::bad_request(
                "core agents must not declare egress domains",
            ));
        }
        let agent_id = registration.manifest.agent_id.clone();
        if self.agents.contains_key(&agent_id) {
            return Err(Error::conflict(format!(
                "agent already registered: {agent_id}"
            )));
        }

        info!(agent_id = %agent_id, "agent registered");
        self.agents.insert(
            agent_id,
            RegisteredAgent {
                registration,
                registered_at_ms: Utc::now().timestamp_millis(),
                last_heartbeat_at_ms: None,
                status: AgentStatus::Registered,
                consecutive_failures: 0,
                last_probe_at_ms: 0,
            },
        );
        Ok(())
    }

    /// Removes a registration
    ///
    /// # Errors
    /// Returns `not_found` for an unknown agent.
    pub fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        self.agents
            .remove(agent_id)
            .map(|_| info!(agent_id = %agent_id, "agent unregistered"))
            .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))
    }

    /// All registrations
    pub fn list_agents(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<RegisteredAgent> =
            self.agents.iter().map(|entry| entry.value().clone()).collect();
        agents.sort_by(|a, b| {
            a.registration
                .manifest
                .agent_id
                .cmp(&b.registration.manifest.agent_id)
        });
        agents
    }

    /// One registration by id
    pub fn get_agent(&self, agent_id: &AgentId) -> Option<RegisteredAgent> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Agents whose manifest advertises `verb`
    pub fn find_agents_for_capability(&self, verb: &CapabilityVerb) -> Vec<RegisteredAgent> {
        let mut agents: Vec<RegisteredAgent> = self
            .agents
            .iter()
            .filter(|entry| entry.value().registration.manifest.advertises(verb))
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| {
            a.registration
                .manifest
                .agent_id
                .cmp(&b.registration.manifest.agent_id)
        });
        agents
    }

    /// Simple system-wide counts
    pub fn system_health(&self) -> SystemHealth {
        let mut healthy = 0;
        let mut degraded = 0;
        let mut unhealthy = 0;
        let mut unreachable = 0;
        for entry in &self.agents {
            match entry.value().status {
                AgentStatus::Healthy | AgentStatus::Registered => healthy += 1,
                AgentStatus::Degraded => degraded += 1,
                AgentStatus::Unhealthy => unhealthy += 1,
                AgentStatus::Unreachable => unreachable += 1,
            }
        }
        let total = self.agents.len();
        SystemHealth {
            status: if degraded + unhealthy + unreachable == 0 {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            total_agents: total,
            healthy,
            degraded,
            unhealthy,
            unreachable,
        }
    }

    /// Applies one probe outcome to an agent's liveness state
    ///
    /// Recovery needs a single success; failures escalate through
    /// `unhealthy` to `unreachable` at the configured thresholds.
    pub fn record_probe(&self, agent_id: &AgentId, success: bool, reported_degraded: bool) {
        let Some(mut entry) = self.agents.get_mut(agent_id) else {
            return;
        };
        let agent = entry.value_mut();
        let now_ms = Utc::now().timestamp_millis();
        agent.last_probe_at_ms = now_ms;

        if success {
            agent.consecutive_failures = 0;
            agent.last_heartbeat_at_ms = Some(now_ms);
            agent.status = if reported_degraded {
                AgentStatus::Degraded
            } else {
                AgentStatus::Healthy
            };
        } else {
            agent.consecutive_failures += 1;
            if agent.consecutive_failures >= self.config.consecutive_unreachable_threshold {
                agent.status = AgentStatus::Unreachable;
            } else if agent.consecutive_failures >= self.config.consecutive_unhealthy_threshold {
                agent.status = AgentStatus::Unhealthy;
            }
        }
    }

    /// Marks agents whose heartbeat is older than three probe intervals as
    /// unreachable
    pub fn enforce_heartbeat_staleness(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for mut entry in self.agents.iter_mut() {
            let agent = entry.value_mut();
            let interval_ms =
                agent.registration.manifest.health_check.interval_seconds as i64 * 1000;
            if let Some(heartbeat) = agent.last_heartbeat_at_ms {
                if now_ms - heartbeat > 3 * interval_ms {
                    if agent.status != AgentStatus::Unreachable {
                        warn!(
                            agent_id = %agent.registration.manifest.agent_id,
                            "heartbeat stale; marking unreachable"
                        );
                    }
                    agent.status = AgentStatus::Unreachable;
                }
            }
        }
    }

    /// Probes one agent's health endpoint now
    pub async fn probe_agent(&self, agent_id: &AgentId) {
        let Some(agent) = self.get_agent(agent_id) else {
            return;
        };
        let timeout =
            Duration::from_secs(agent.registration.manifest.health_check.timeout_seconds.max(1));

        let outcome = self
            .http
            .get(&agent.registration.health_endpoint)
            .timeout(timeout)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                let degraded = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body["status"].as_str().map(|s| s == "degraded"))
                    .unwrap_or(false);
                self.record_probe(agent_id, true, degraded);
            }
            Ok(response) => {
                debug!(agent_id = %agent_id, status = %response.status(), "probe failed");
                self.record_probe(agent_id, false, false);
            }
            Err(err) => {
                debug!(agent_id = %agent_id, error = %err, "probe unreachable");
                self.record_probe(agent_id, false, false);
            }
        }
    }

    /// Starts the background liveness prober; starting twice is a no-op
    pub fn start_prober(self: &Arc<Self>) {
        let mut prober = self.prober.lock().expect("prober lock poisoned");
        if prober.is_some() {
            warn!("liveness prober already running");
            return;
        }

        let registry = self.clone();
        let cancel = self.cancel.clone();
        *prober = Some(tokio::spawn(async move {
            info!("liveness prober started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(1)) => {}
                }

                let now_ms = Utc::now().timestamp_millis();
                let due: Vec<AgentId> = registry
                    .agents
                    .iter()
                    .filter(|entry| {
                        let agent = entry.value();
                        let interval_ms =
                            agent.registration.manifest.health_check.interval_seconds as i64
                                * 1000;
                        now_ms - agent.last_probe_at_ms >= interval_ms
                    })
                    .map(|entry| entry.key().clone())
                    .collect();

                let probes = due.iter().map(|agent_id| registry.probe_agent(agent_id));
                join_all(probes).await;
                registry.enforce_heartbeat_staleness();
            }
            info!("liveness prober stopped");
        }));
    }

    /// Stops the prober and waits for it
    pub async fn stop(&self) {
        self.cancel.cancel();
        let prober = self.prober.lock().expect("prober lock poisoned").take();
        if let Some(prober) = prober {
            let _ = prober.await;
        }
    }

    /// Fans out to every agent's `/metrics` and aggregates SLA violations,
    /// degrading agents, and system-level recommendations
    ///
    /// Per-agent failures contribute an `{error}` entry and never abort the
    /// aggregate.
    pub async fn enhanced_dashboard(&self) -> Value {
        let agents = self.list_agents();
        let fetches = agents.iter().map(|agent| {
            let url = format!(
                "{}/metrics",
                agent.registration.base_url.trim_end_matches('/')
            );
            let timeout = Duration::from_secs(
                agent.registration.manifest.health_check.timeout_seconds.max(1),
            );
            let http = self.http.clone();
            async move {
                let result: std::result::Result<Value, String> = async {
                    let response = http
                        .get(&url)
                        .timeout(timeout)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("metrics returned {}", response.status()));
                    }
                    response.json::<Value>().await.map_err(|e| e.to_string())
                }
                .await;
                result
            }
        });
        let metrics = join_all(fetches).await;

        let mut agent_details = serde_json::Map::new();
        let mut monitored = 0usize;
        let mut sla_violations = 0usize;
        let mut degrading = 0usize;

        for (agent, outcome) in agents.iter().zip(metrics) {
            let agent_id = agent.registration.manifest.agent_id.to_string();
            match outcome {
                Ok(details) => {
                    monitored += 1;
                    let compliant = details["dashboard"]["sla"]["overall_compliant"]
                        .as_bool()
                        .unwrap_or(true);
                    if !compliant {
                        sla_violations += 1;
                    }
                    let trend = details["dashboard"]["performance_summary"]["trend_analysis"]
                        ["trend"]
                        .as_str()
                        .unwrap_or("stable");
                    if trend == "degrading" {
                        degrading += 1;
                    }
                    agent_details.insert(agent_id, details);
                }
                Err(message) => {
                    agent_details.insert(agent_id, json!({ "error": message }));
                }
            }
        }

        let mut recommendations = Vec::new();
        if sla_violations > 0 {
            recommendations.push(format!(
                "{sla_violations} agent(s) violating SLA; inspect their dashboards"
            ));
        }
        if degrading > 0 {
            recommendations.push(format!(
                "{degrading} agent(s) degrading; investigate upstream latency before failures"
            ));
        }
        let unreachable = agents.len() - monitored;
        if unreachable > 0 {
            recommendations.push(format!(
                "{unreachable} agent(s) unreachable for metrics; verify they are running"
            ));
        }

        let system = self.system_health();
        json!({
            "system_overview": system,
            "performance_overview": {
                "monitored_agents": monitored,
                "sla_violations": sla_violations,
                "degrading_agents": degrading,
            },
            "agent_details": Value::Object(agent_details),
            "system_recommendations": recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AgentManifest, Capability, HealthCheckConfig};
    use serde_json::json;

    fn agent_id(id: &str) -> AgentId {
        AgentId::try_new(id.to_string()).unwrap()
    }

    fn verb(name: &str) -> CapabilityVerb {
        CapabilityVerb::try_new(name.to_string()).unwrap()
    }

    fn registration(id: &str, verbs: &[&str]) -> AgentRegistration {
        AgentRegistration {
            manifest: AgentManifest {
                agent_id: agent_id(id),
                version: "1.0.0".to_string(),
                display_name: id.to_string(),
                description: format!("test agent {id}"),
                capabilities: verbs
                    .iter()
                    .map(|v| Capability {
                        verb: verb(v),
                        description: format!("capability {v}"),
                        input_schema: json!({"type": "object"}),
                        output_schema: json!({"type": "object"}),
                        safety_annotations: vec![],
                    })
                    .collect(),
                data_scopes: vec![],
                tool_access: vec![],
                egress_domains: vec![],
                health_check: HealthCheckConfig::default(),
            },
            base_url: format!("http://127.0.0.1:0/{id}"),
            health_endpoint: format!("http://127.0.0.1:0/{id}/health"),
        }
    }

    #[test]
    fn register_then_find_by_capability() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        registry
            .register(registration("mail-agent", &["mail.search", "mail.read"]))
            .unwrap();

        let found = registry.find_agents_for_capability(&verb("mail.search"));
        assert_eq!(found.len(), 1);
        let found = registry.find_agents_for_capability(&verb("mail.read"));
        assert_eq!(found.len(), 1);
        let found = registry.find_agents_for_capability(&verb("calendar.read"));
        assert!(found.is_empty());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();
        let err = registry
            .register(registration("mail-agent", &["mail.search"]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn register_unregister_register_is_idempotent() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();
        registry.unregister(&agent_id("mail-agent")).unwrap();
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();

        assert_eq!(registry.list_agents().len(), 1);
        assert_eq!(
            registry
                .find_agents_for_capability(&verb("mail.search"))
                .len(),
            1
        );
    }

    #[test]
    fn egress_domains_violate_local_first() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        let mut reg = registration("leaky-agent", &["mail.search"]);
        reg.manifest.egress_domains = vec!["api.example.com".to_string()];
        let err = registry.register(reg).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        let err = registry.unregister(&agent_id("ghost")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn probe_failures_escalate_and_one_success_recovers() {
        let registry = AgentRegistry::new(RegistryConfig {
            consecutive_unhealthy_threshold: 3,
            consecutive_unreachable_threshold: 10,
        });
        let id = agent_id("mail-agent");
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();

        registry.record_probe(&id, false, false);
        registry.record_probe(&id, false, false);
        assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Registered);

        registry.record_probe(&id, false, false);
        assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Unhealthy);

        for _ in 0..7 {
            registry.record_probe(&id, false, false);
        }
        assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Unreachable);

        registry.record_probe(&id, true, false);
        assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Healthy);
        assert_eq!(registry.get_agent(&id).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn degraded_report_is_reflected() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        let id = agent_id("mail-agent");
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();
        registry.record_probe(&id, true, true);
        assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Degraded);

        let health = registry.system_health();
        assert_eq!(health.status, "degraded");
        assert_eq!(health.degraded, 1);
    }

    #[test]
    fn system_health_counts_statuses() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        registry.register(registration("a-agent", &["a.one"])).unwrap();
        registry.register(registration("b-agent", &["b.one"])).unwrap();
        registry.record_probe(&agent_id("a-agent"), true, false);

        let health = registry.system_health();
        assert_eq!(health.total_agents, 2);
        assert_eq!(health.healthy, 2);
        assert_eq!(health.status, "healthy");
    }

    #[tokio::test]
    async fn dashboard_tolerates_unreachable_agents() {
        let registry = AgentRegistry::new(RegistryConfig::default());
        registry.register(registration("mail-agent", &["mail.search"])).unwrap();

        let dashboard = registry.enhanced_dashboard().await;
        assert_eq!(dashboard["performance_overview"]["monitored_agents"], 0);
        assert!(dashboard["agent_details"]["mail-agent"]["error"].is_string());
        assert!(dashboard["system_recommendations"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r.as_str().unwrap().contains("unreachable")));
    }
}
