//! Agent service base
//!
//! The composition every Steward agent is built from: a semantic cache, a
//! query interpreter, a performance monitor, and a table of capability
//! handlers, wired together behind one `handle_query` pipeline and a
//! uniform HTTP surface. Subclass hooks are supplied functions; there is no
//! inheritance.

pub mod http;
pub mod warming;

use crate::cache::{CacheLookup, SemanticCache};
use crate::cache::l3::RelationshipEdge;
use crate::domain_types::{AgentId, CapabilityVerb, Confidence, MaxInFlightCalls, QueryText, TimeoutMs};
use crate::error::{Error, Result};
use crate::llm::{CapabilitySummary, Interpretation, Interpreter};
use crate::manifest::{AgentManifest, Capability, HealthCheckConfig};
use crate::monitor::PerformanceTracker;
use crate::registry::RegistryClient;
use crate::schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long a dependency call may wait for a concurrency permit before the
/// request is rejected
const DEPENDENCY_QUEUE_WAIT: Duration = Duration::from_millis(100);

/// A capability implementation
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Executes the capability with validated parameters
    async fn execute(&self, parameters: Value) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> CapabilityHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, parameters: Value) -> Result<Value> {
        (self)(parameters).await
    }
}

/// A registered capability: its advertised spec plus the handler
#[derive(Clone)]
struct RegisteredCapability {
    spec: Capability,
    handler: Arc<dyn CapabilityHandler>,
}

/// A registered internal tool
#[derive(Clone)]
struct RegisteredTool {
    schema: Value,
    handler: Arc<dyn CapabilityHandler>,
}

/// A declared cross-agent dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDependency {
    /// The depended-on agent
    pub agent_id: AgentId,
    /// Capabilities this agent may call there; empty means any
    pub capabilities: Vec<CapabilityVerb>,
    /// Whether a failure surfaces as an error (true) or a null sub-result
    pub required: bool,
    /// Deadline for calls to this dependency
    pub timeout: TimeoutMs,
}

/// Outcome of the natural-language pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceResult {
    /// Handler output; absent on low-confidence rejection
    pub result: Option<Value>,
    /// Confidence surfaced to the caller (1.0 for fresh L1 hits)
    pub confidence: Confidence,
    /// Whether the fallback capability replaced the interpreted one
    pub fallback_used: bool,
    /// Wall time spent in the pipeline
    pub duration_ms: f64,
    /// Whether a cached interpretation was used
    pub cached: bool,
    /// `low_confidence` when rejected below threshold without a fallback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Static configuration for one agent service
#[derive(Clone)]
pub struct AgentServiceConfig {
    /// Agent semantic version, advertised in the manifest
    pub version: String,
    /// Threshold below which interpretations fall back or fail
    pub min_confidence: Confidence,
    /// Verb substituted when the interpreter is below threshold
    pub fallback_capability: Option<CapabilityVerb>,
    /// Concurrency bound on dependency calls
    pub max_in_flight_calls: MaxInFlightCalls,
    /// Data scopes advertised in the manifest
    pub data_scopes: Vec<String>,
}

impl Default for AgentServiceConfig {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            min_confidence: Confidence::try_new(0.7).expect("0.7 is a valid confidence"),
            fallback_capability: None,
            max_in_flight_calls: MaxInFlightCalls::try_new(32).expect("32 is a valid bound"),
            data_scopes: Vec::new(),
        }
    }
}

/// The base every agent specializes through registration and supplied
/// functions
pub struct AgentService {
    agent_id: AgentId,
    display_name: String,
    description: String,
    config: AgentServiceConfig,
    capabilities: RwLock<HashMap<CapabilityVerb, RegisteredCapability>>,
    tools: RwLock<HashMap<String, RegisteredTool>>,
    dependencies: RwLock<HashMap<AgentId, AgentDependency>>,
    cache: SemanticCache,
    interpreter: Arc<dyn Interpreter>,
    monitor: PerformanceTracker,
    registry: Option<Arc<RegistryClient>>,
    context_fn: Box<dyn Fn() -> String + Send + Sync>,
    dependency_gate: tokio::sync::Semaphore,
}

impl AgentService {
    /// Assembles an agent from its components
    pub fn new(
        agent_id: AgentId,
        display_name: impl Into<String>,
        description: impl Into<String>,
        cache: SemanticCache,
        interpreter: Arc<dyn Interpreter>,
        monitor: PerformanceTracker,
        config: AgentServiceConfig,
    ) -> Self {
        let description = description.into();
        let default_context = description.clone();
        Self {
            agent_id,
            display_name: display_name.into(),
            description,
            dependency_gate: tokio::sync::Semaphore::new(config.max_in_flight_calls.as_usize()),
            config,
            capabilities: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(HashMap::new()),
            cache,
            interpreter,
            monitor,
            registry: None,
            context_fn: Box::new(move || default_context.clone()),
        }
    }

    /// Supplies the short natural-language context fed to the interpreter
    #[must_use]
    pub fn with_context_fn(
        mut self,
        context_fn: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.context_fn = Box::new(context_fn);
        self
    }

    /// Attaches a registry client for cross-agent calls
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The agent identifier
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The human-readable name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The performance monitor
    pub fn monitor(&self) -> &PerformanceTracker {
        &self.monitor
    }

    /// The semantic cache
    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    /// Registers a capability; the verb shape is enforced by the type
    ///
    /// # Errors
    /// Returns `conflict` when the verb is already registered.
    pub fn register_capability(
        &self,
        spec: Capability,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<()> {
        let mut capabilities = self.capabilities.write().expect("capability lock poisoned");
        if capabilities.contains_key(&spec.verb) {
            return Err(Error::conflict(format!(
                "capability already registered: {}",
                spec.verb
            )));
        }
        info!(agent_id = %self.agent_id, verb = %spec.verb, "capability registered");
        capabilities.insert(spec.verb.clone(), RegisteredCapability { spec, handler });
        Ok(())
    }

    /// Registers an internal tool
    ///
    /// # Errors
    /// Returns `conflict` when the name is already registered.
    pub fn register_tool(
        &self,
        name: impl Into<String>,
        schema: Value,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<()> {
        let name = name.into();
        let mut tools = self.tools.write().expect("tool lock poisoned");
        if tools.contains_key(&name) {
            return Err(Error::conflict(format!("tool already registered: {name}")));
        }
        tools.insert(name, RegisteredTool { schema, handler });
        Ok(())
    }

    /// Declares a dependency on another agent; redeclaring overwrites
    pub fn register_agent_dependency(&self, dependency: AgentDependency) {
        self.dependencies
            .write()
            .expect("dependency lock poisoned")
            .insert(dependency.agent_id.clone(), dependency);
    }

    /// The agent's own context paragraph
    pub fn agent_context(&self) -> String {
        (self.context_fn)()
    }

    /// Context enriched with declared dependencies, so the interpreter
    /// knows what the agent can reach across platforms
    pub fn multi_platform_context(&self) -> String {
        let dependencies = self.dependencies.read().expect("dependency lock poisoned");
        if dependencies.is_empty() {
            return self.agent_context();
        }
        let mut context = self.agent_context();
        context.push_str("\nCan also call these agents: ");
        let mut lines: Vec<String> = dependencies
            .values()
            .map(|d| {
                let verbs: Vec<String> =
                    d.capabilities.iter().map(ToString::to_string).collect();
                format!("{} ({})", d.agent_id, verbs.join(", "))
            })
            .collect();
        lines.sort();
        context.push_str(&lines.join("; "));
        context
    }

    /// Capability summaries for the dispatch prompt
    pub fn capability_summaries(&self) -> Vec<CapabilitySummary> {
        let capabilities = self.capabilities.read().expect("capability lock poisoned");
        let mut summaries: Vec<CapabilitySummary> = capabilities
            .values()
            .map(|c| CapabilitySummary {
                verb: c.spec.verb.clone(),
                description: c.spec.description.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.verb.cmp(&b.verb));
        summaries
    }

    /// The natural-language entrypoint
    ///
    /// Consults the cache, falls back to the interpreter on a miss, applies
    /// the confidence threshold and fallback capability, executes the
    /// chosen handler, and records the outcome.
    ///
    /// # Errors
    /// Returns `bad_request` for an empty query, `not_found` when the
    /// interpreted capability has no handler, and the handler's own error
    /// on execution failure. A below-threshold interpretation without a
    /// fallback is not an `Err`: it returns a `ConfidenceResult` carrying
    /// `error = "low_confidence"` so callers keep the confidence score.
    pub async fn handle_query(&self, query: &str) -> Result<ConfidenceResult> {
        let started = Instant::now();
        let query = QueryText::try_new(query.to_string()).map_err(|_| {
            Error::bad_request("query must be non-empty and at most 4096 characters")
        })?;
        let query = query.as_str();

        let min = self.config.min_confidence;
        let mut cached = false;
        let mut fallback_used = false;

        let cache_hit = match self.cache.get(query).await {
            CacheLookup::Hit { value, confidence, .. } if confidence >= min => {
                serde_json::from_value::<Interpretation>(value)
                    .ok()
                    .map(|interpretation| (interpretation, confidence))
            }
            _ => None,
        };

        let (interpretation, reported_confidence) = match cache_hit {
            Some((interpretation, confidence)) => {
                cached = true;
                (interpretation, confidence)
            }
            None => {
                let mut interpretation = self
                    .interpreter
                    .interpret(
                        query,
                        &self.multi_platform_context(),
                        &self.capability_summaries(),
                    )
                    .await;

                if interpretation.confidence < min {
                    match &self.config.fallback_capability {
                        Some(fallback) => {
                            // Best-effort dispatch: the fallback verb takes
                            // over, original parameters are retained.
                            interpretation.capability = fallback.to_string();
                            fallback_used = true;
                        }
                        None => {
                            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                            self.monitor.record_operation(duration_ms, false, None);
                            return Ok(ConfidenceResult {
                                result: None,
                                confidence: interpretation.confidence,
                                fallback_used: false,
                                duration_ms,
                                cached: false,
                                error: Some("low_confidence".to_string()),
                            });
                        }
                    }
                }

                let confidence = interpretation.confidence;
                match serde_json::to_value(&interpretation) {
                    Ok(blob) => self.cache.set(query, &blob, confidence).await,
                    Err(err) => warn!(error = %err, "interpretation not cacheable"),
                }
                (interpretation, confidence)
            }
        };

        let verb = CapabilityVerb::try_new(interpretation.capability.clone()).map_err(|_| {
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.monitor.record_operation(duration_ms, false, None);
            Error::not_found(format!(
                "interpreted capability is not dispatchable: {}",
                interpretation.capability
            ))
        })?;

        let handler = {
            let capabilities = self.capabilities.read().expect("capability lock poisoned");
            capabilities.get(&verb).map(|c| c.handler.clone())
        };
        let Some(handler) = handler else {
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.monitor
                .record_operation(duration_ms, false, Some(verb.as_str()));
            return Err(Error::not_found(format!("unknown capability: {verb}")));
        };

        let outcome = handler.execute(interpretation.parameters.clone()).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(result) => {
                self.monitor
                    .record_operation(duration_ms, true, Some(verb.as_str()));
                Ok(ConfidenceResult {
                    result: Some(result),
                    confidence: reported_confidence,
                    fallback_used,
                    duration_ms,
                    cached,
                    error: None,
                })
            }
            Err(err) => {
                self.monitor
                    .record_operation(duration_ms, false, Some(verb.as_str()));
                Err(err)
            }
        }
    }

    /// Direct capability invocation, bypassing cache and interpreter
    ///
    /// Validates the input against the verb's schema and records timing.
    ///
    /// # Errors
    /// Returns `not_found` for an unknown verb, `bad_request` on schema
    /// violations, or the handler's error.
    pub async fn execute_capability(
        &self,
        verb: &CapabilityVerb,
        input: Value,
    ) -> Result<(Value, f64)> {
        let started = Instant::now();

        let registered = {
            let capabilities = self.capabilities.read().expect("capability lock poisoned");
            capabilities.get(verb).cloned()
        };
        let Some(registered) = registered else {
            return Err(Error::not_found(format!("unknown capability: {verb}")));
        };

        let violations = schema::validate(&registered.spec.input_schema, &input);
        if !violations.is_empty() {
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.monitor
                .record_operation(duration_ms, false, Some(verb.as_str()));
            return Err(Error::bad_request("input failed schema validation")
                .with_details(json!({ "violations": violations })));
        }

        let outcome = registered.handler.execute(input).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.monitor
            .record_operation(duration_ms, outcome.is_ok(), Some(verb.as_str()));
        outcome.map(|output| (output, duration_ms))
    }

    /// Runs an internal tool by name
    ///
    /// # Errors
    /// Returns `not_found` for an unknown tool, `bad_request` on schema
    /// violations, or the handler's error.
    pub async fn run_tool(&self, name: &str, input: Value) -> Result<Value> {
        let tool = {
            let tools = self.tools.read().expect("tool lock poisoned");
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Err(Error::not_found(format!("unknown tool: {name}")));
        };
        let violations = schema::validate(&tool.schema, &input);
        if !violations.is_empty() {
            return Err(Error::bad_request("tool input failed schema validation")
                .with_details(json!({ "violations": violations })));
        }
        tool.handler.execute(input).await
    }

    /// Calls a capability on a declared dependency through the registry
    ///
    /// Optional dependencies swallow failures into `Ok(None)`; required
    /// ones surface them.
    ///
    /// # Errors
    /// Returns `not_found` for undeclared dependencies, `bad_request` for a
    /// verb outside the declared set, `resource_exhausted` when the
    /// concurrency bound is held too long, and the transport error for
    /// required dependencies.
    pub async fn call_dependency(
        &self,
        agent_id: &AgentId,
        verb: &CapabilityVerb,
        parameters: Value,
    ) -> Result<Option<Value>> {
        let dependency = {
            let dependencies = self.dependencies.read().expect("dependency lock poisoned");
            dependencies.get(agent_id).cloned()
        };
        let Some(dependency) = dependency else {
            return Err(Error::not_found(format!("undeclared dependency: {agent_id}")));
        };

        if !dependency.capabilities.is_empty() && !dependency.capabilities.contains(verb) {
            return Err(Error::bad_request(format!(
                "verb {verb} is not declared for dependency {agent_id}"
            )));
        }

        let Some(registry) = &self.registry else {
            return Err(Error::upstream_unavailable("no registry client configured"));
        };

        let permit =
            match tokio::time::timeout(DEPENDENCY_QUEUE_WAIT, self.dependency_gate.acquire()).await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    return Err(Error::resource_exhausted(
                        "dependency call concurrency bound reached",
                    ))
                }
            };

        let started = Instant::now();
        let result = async {
            let agent = registry.resolve(agent_id).await?;
            agent
                .call(verb, parameters, dependency.timeout.as_duration())
                .await
        }
        .await;
        drop(permit);

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.monitor
            .record_operation(duration_ms, result.is_ok(), Some(verb.as_str()));

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if !dependency.required => {
                warn!(
                    agent_id = %agent_id,
                    error = %err,
                    "optional dependency failed; continuing with null sub-result"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Stores a relationship edge observed across platforms
    ///
    /// # Errors
    /// Returns an error on durable-store failure.
    pub async fn cache_relationship(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: &str,
        related_id: &str,
        attributes: &Value,
        confidence: Confidence,
    ) -> Result<()> {
        self.cache
            .cache_relationship(
                entity_type,
                entity_id,
                related_type,
                related_id,
                attributes,
                confidence,
            )
            .await
    }

    /// Fetches relationship edges for an entity
    ///
    /// # Errors
    /// Returns an error on durable-store failure.
    pub async fn get_relationships(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: Option<&str>,
    ) -> Result<Vec<RelationshipEdge>> {
        self.cache
            .relationships(entity_type, entity_id, related_type)
            .await
    }

    /// Assembles the manifest from registrations
    pub fn generate_manifest(&self) -> AgentManifest {
        let capabilities = self.capabilities.read().expect("capability lock poisoned");
        let mut specs: Vec<Capability> =
            capabilities.values().map(|c| c.spec.clone()).collect();
        specs.sort_by(|a, b| a.verb.cmp(&b.verb));

        let mut tool_access: Vec<String> = self
            .tools
            .read()
            .expect("tool lock poisoned")
            .keys()
            .cloned()
            .collect();
        tool_access.sort();

        AgentManifest {
            agent_id: self.agent_id.clone(),
            version: self.config.version.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            capabilities: specs,
            data_scopes: self.config.data_scopes.clone(),
            tool_access,
            // Local-first: core agents never egress.
            egress_domains: Vec::new(),
            health_check: HealthCheckConfig::default(),
        }
    }

    /// Health summary for the `/health` endpoint
    pub fn health(&self) -> Value {
        let compliance = self.monitor.check_sla_compliance();
        let status = if compliance.overall_compliant {
            "healthy"
        } else {
            "degraded"
        };
        json!({
            "status": status,
            "details": {
                "agent_id": self.agent_id,
                "display_name": self.display_name,
            },
            "performance_summary": self.monitor.current_metrics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SemanticCacheConfig;
    use crate::llm::ScriptedInterpreter;
    use crate::monitor::{SlaConfig, TrackerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent_id() -> AgentId {
        AgentId::try_new("mail".to_string()).unwrap()
    }

    fn verb(name: &str) -> CapabilityVerb {
        CapabilityVerb::try_new(name.to_string()).unwrap()
    }

    fn conf(v: f64) -> Confidence {
        Confidence::try_new(v).unwrap()
    }

    fn capability(name: &str) -> Capability {
        Capability {
            verb: verb(name),
            description: format!("test capability {name}"),
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": "object"}),
            safety_annotations: vec![],
        }
    }

    async fn build_service(
        dir: &std::path::Path,
        interpreter: Arc<dyn Interpreter>,
        fallback: Option<&str>,
    ) -> (Arc<AgentService>, Arc<AtomicUsize>) {
        let cache = SemanticCache::open(dir, agent_id(), None, SemanticCacheConfig::default())
            .await
            .unwrap();
        let config = AgentServiceConfig {
            fallback_capability: fallback.map(verb),
            ..AgentServiceConfig::default()
        };
        let service = AgentService::new(
            agent_id(),
            "Mail Agent",
            "Searches locally synced mail",
            cache,
            interpreter,
            PerformanceTracker::new(TrackerConfig::default(), SlaConfig::default()),
            config,
        )
        .with_context_fn(|| "Mail agent for locally synced mail".to_string());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        let handler = move |parameters: Value| {
            let calls = calls_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"echo": parameters}))
            }
        };
        service
            .register_capability(capability("mail.search"), Arc::new(handler))
            .unwrap();
        (Arc::new(service), calls)
    }

    fn interpretation(capability: &str, confidence: f64) -> Interpretation {
        Interpretation {
            capability: capability.to_string(),
            parameters: json!({"q": "project x"}),
            confidence: conf(confidence),
            reasoning: None,
            unsupported: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn cached_interpretation_skips_the_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, calls) = build_service(dir.path(), scripted.clone(), None).await;

        let blob = serde_json::to_value(interpretation("mail.search", 0.9)).unwrap();
        service
            .cache()
            .set("find emails about project x", &blob, conf(0.9))
            .await;

        let result = service
            .handle_query("find emails about project x")
            .await
            .unwrap();
        assert!(result.cached);
        assert!(!result.fallback_used);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scripted.calls(), 0);
        // Fresh L1 hits are fully trusted.
        assert!((result.confidence.value() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn llm_path_caches_and_executes() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
            "mail.search",
            0.85,
        )));
        let (service, calls) = build_service(dir.path(), scripted.clone(), None).await;

        let result = service.handle_query("find emails").await.unwrap();
        assert!(!result.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scripted.calls(), 1);

        // Second time around the cache serves the interpretation.
        let result = service.handle_query("find emails").await.unwrap();
        assert!(result.cached);
        assert_eq!(scripted.calls(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn low_confidence_with_fallback_substitutes_capability() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
            "mail.unknown",
            0.55,
        )));
        let (service, calls) = build_service(dir.path(), scripted, Some("mail.search")).await;

        let result = service.handle_query("do something odd").await.unwrap();
        assert!(result.fallback_used);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Original parameters are preserved through the fallback.
        assert_eq!(result.result.unwrap()["echo"]["q"], "project x");
        assert!((result.confidence.value() - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn low_confidence_without_fallback_reports_not_executes() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
            "mail.search",
            0.5,
        )));
        let (service, calls) = build_service(dir.path(), scripted, None).await;

        let result = service.handle_query("vague request").await.unwrap();
        assert_eq!(result.error.as_deref(), Some("low_confidence"));
        assert!(result.result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The failed attempt is still a performance sample.
        assert_eq!(service.monitor().sample_count(), 1);
    }

    #[tokio::test]
    async fn confidence_exactly_at_threshold_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
            "mail.search",
            0.7,
        )));
        let (service, calls) = build_service(dir.path(), scripted, None).await;

        let result = service.handle_query("boundary query").await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_query_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        let err = service.handle_query("   ").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn duplicate_capability_registration_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        let err = service
            .register_capability(
                capability("mail.search"),
                Arc::new(|_parameters: Value| async move { Ok(json!({})) }),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn execute_capability_validates_input_schema() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        let strict = Capability {
            verb: verb("mail.read"),
            description: "Read one message".to_string(),
            input_schema: json!({"type": "object", "required": ["id"]}),
            output_schema: json!({"type": "object"}),
            safety_annotations: vec![],
        };
        service
            .register_capability(
                strict,
                Arc::new(|_parameters: Value| async move { Ok(json!({"body": "hi"})) }),
            )
            .unwrap();

        let err = service
            .execute_capability(&verb("mail.read"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);

        let (output, _) = service
            .execute_capability(&verb("mail.read"), json!({"id": "m1"}))
            .await
            .unwrap();
        assert_eq!(output["body"], "hi");
    }

    #[tokio::test]
    async fn unknown_capability_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        let err = service
            .execute_capability(&verb("mail.missing"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn run_tool_validates_and_executes() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        service
            .register_tool(
                "snippet_builder",
                json!({"type": "object", "required": ["text"]}),
                Arc::new(|parameters: Value| async move {
                    Ok(json!({"snippet": parameters["text"]}))
                }),
            )
            .unwrap();

        let err = service.run_tool("snippet_builder", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);

        let output = service
            .run_tool("snippet_builder", json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(output["snippet"], "hello");

        let err = service.run_tool("missing", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn relationship_round_trip_through_service() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        service
            .cache_relationship(
                "contact",
                "jane",
                "email",
                "jane@example.com",
                &json!({"kind": "primary"}),
                conf(0.95),
            )
            .await
            .unwrap();

        let edges = service
            .get_relationships("contact", "jane", Some("email"))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].related_id, "jane@example.com");
    }

    #[tokio::test]
    async fn manifest_reflects_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        service
            .register_tool(
                "snippet_builder",
                json!({"type": "object"}),
                Arc::new(|_parameters: Value| async move { Ok(json!({})) }),
            )
            .unwrap();

        let manifest = service.generate_manifest();
        assert_eq!(manifest.agent_id, agent_id());
        assert_eq!(manifest.capabilities.len(), 1);
        assert_eq!(manifest.tool_access, vec!["snippet_builder".to_string()]);
        assert!(manifest.egress_domains.is_empty());
    }

    #[tokio::test]
    async fn multi_platform_context_names_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        service.register_agent_dependency(AgentDependency {
            agent_id: AgentId::try_new("contacts-agent".to_string()).unwrap(),
            capabilities: vec![verb("contacts.resolve")],
            required: false,
            timeout: TimeoutMs::try_new(3000).unwrap(),
        });

        let context = service.multi_platform_context();
        assert!(context.contains("contacts-agent"));
        assert!(context.contains("contacts.resolve"));
    }

    #[tokio::test]
    async fn optional_dependency_failure_yields_null_sub_result() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;
        // Nothing listens here; every resolve fails.
        let service = Arc::try_unwrap(service)
            .unwrap_or_else(|_| panic!("service still shared"))
            .with_registry(Arc::new(crate::registry::RegistryClient::new(
                "http://127.0.0.1:1",
            )));

        let contacts = AgentId::try_new("contacts-agent".to_string()).unwrap();
        service.register_agent_dependency(AgentDependency {
            agent_id: contacts.clone(),
            capabilities: vec![verb("contacts.resolve")],
            required: false,
            timeout: TimeoutMs::try_new(500).unwrap(),
        });

        let result = service
            .call_dependency(&contacts, &verb("contacts.resolve"), json!({"name": "jane"}))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn required_dependency_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;
        let service = Arc::try_unwrap(service)
            .unwrap_or_else(|_| panic!("service still shared"))
            .with_registry(Arc::new(crate::registry::RegistryClient::new(
                "http://127.0.0.1:1",
            )));

        let contacts = AgentId::try_new("contacts-agent".to_string()).unwrap();
        service.register_agent_dependency(AgentDependency {
            agent_id: contacts.clone(),
            capabilities: vec![],
            required: true,
            timeout: TimeoutMs::try_new(500).unwrap(),
        });

        let err = service
            .call_dependency(&contacts, &verb("contacts.resolve"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::UpstreamUnavailable | crate::error::ErrorKind::Internal
        ));
    }

    #[tokio::test]
    async fn undeclared_dependency_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedInterpreter::default());
        let (service, _) = build_service(dir.path(), scripted, None).await;

        let err = service
            .call_dependency(
                &AgentId::try_new("ghost".to_string()).unwrap(),
                &verb("ghost.walk"),
                json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
