//! Gateway: the user-facing front door
//!
//! Classifies intent within a tight budget (local model first, keyword
//! matcher as fallback), then either invokes a single agent capability
//! directly or hands the request to the coordinator pipeline. Also exposes
//! the cross-agent capability union and a WebSocket stream emitting
//! `status → intent → partial* → result` frames.

use crate::coordinator::{classify_intent, Coordinator};
use crate::domain_types::{AgentId, CapabilityVerb};
use crate::error::{Error, ErrorEnvelope, Result};
use crate::llm::{CapabilitySummary, Interpreter};
use crate::registry::RegistryClient;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Budget for intent classification, LLM path included
const CLASSIFY_BUDGET: Duration = Duration::from_millis(500);

/// Confidence the LLM verdict needs before the gateway routes directly
const DIRECT_ROUTE_THRESHOLD: f64 = 0.75;

/// Deadline for a direct agent call made on behalf of the user
const DIRECT_CALL_DEADLINE: Duration = Duration::from_secs(10);

/// A capability along with the agent advertising it
#[derive(Debug, Clone, Serialize)]
pub struct GlobalCapability {
    /// Advertising agent
    pub agent_id: AgentId,
    /// The verb
    pub verb: CapabilityVerb,
    /// One-line description
    pub description: String,
}

/// Chosen route for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Direct,
    Coordinator,
}

/// Outcome of intent classification
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Direct agent call or coordinator orchestration
    pub route: Route,
    /// Target agent for direct routes
    pub agent_id: Option<AgentId>,
    /// Target capability for direct routes
    pub capability: Option<CapabilityVerb>,
    /// Parameters for the direct call
    pub parameters: Value,
    /// Coarse intent label
    pub intent: String,
    /// Classifier confidence
    pub confidence: f64,
}

/// Intent classifier with a hard budget and a keyword fallback
pub struct IntentClassifier {
    interpreter: Option<Arc<dyn Interpreter>>,
    budget: Duration,
}

impl IntentClassifier {
    /// Creates a classifier; without an interpreter only the keyword
    /// matcher runs
    pub fn new(interpreter: Option<Arc<dyn Interpreter>>) -> Self {
        Self {
            interpreter,
            budget: CLASSIFY_BUDGET,
        }
    }

    /// Classifies `query` against the currently available capabilities
    pub async fn classify(&self, query: &str, available: &[GlobalCapability]) -> RoutingDecision {
        if let Some(interpreter) = &self.interpreter {
            let summaries: Vec<CapabilitySummary> = available
                .iter()
                .map(|c| CapabilitySummary {
                    verb: c.verb.clone(),
                    description: format!("{} (agent {})", c.description, c.agent_id),
                })
                .collect();
            let context =
                "Gateway dispatcher for a local multi-agent personal assistant".to_string();

            let verdict = tokio::time::timeout(
                self.budget,
                interpreter.interpret(query, &context, &summaries),
            )
            .await;

            match verdict {
                Ok(interpretation) => {
                    let matched = available
                        .iter()
                        .find(|c| c.verb.as_str() == interpretation.capability);
                    if let Some(capability) = matched {
                        if interpretation.confidence.value() >= DIRECT_ROUTE_THRESHOLD {
                            return RoutingDecision {
                                route: Route::Direct,
                                agent_id: Some(capability.agent_id.clone()),
                                capability: Some(capability.verb.clone()),
                                parameters: interpretation.parameters,
                                intent: format!("{}_operation", capability.verb.domain()),
                                confidence: interpretation.confidence.value(),
                            };
                        }
                    }
                    debug!(
                        capability = %interpretation.capability,
                        confidence = interpretation.confidence.value(),
                        "model verdict below direct-route bar; falling back to keywords"
                    );
                }
                Err(_) => {
                    debug!("intent classification exceeded budget; falling back to keywords");
                }
            }
        }

        self.keyword_fallback(query, available)
    }

    /// Deterministic keyword classification
    ///
    /// Single-lookup intents route directly when a live agent advertises
    /// the verb; multi-step intents and everything else go to the
    /// coordinator.
    fn keyword_fallback(&self, query: &str, available: &[GlobalCapability]) -> RoutingDecision {
        let intent = classify_intent(query);
        let direct_verb = match intent {
            "contacts_operation" => Some("contacts.resolve"),
            "memory_operation" => Some("memory.retrieve"),
            _ => None,
        };

        if let Some(verb) = direct_verb {
            if let Some(capability) = available.iter().find(|c| c.verb.as_str() == verb) {
                return RoutingDecision {
                    route: Route::Direct,
                    agent_id: Some(capability.agent_id.clone()),
                    capability: Some(capability.verb.clone()),
                    parameters: json!({ "query": query }),
                    intent: intent.to_string(),
                    confidence: 0.6,
                };
            }
        }

        RoutingDecision {
            route: Route::Coordinator,
            agent_id: None,
            capability: None,
            parameters: json!({}),
            intent: intent.to_string(),
            confidence: 0.5,
        }
    }
}

/// The gateway service
pub struct Gateway {
    registry: Arc<RegistryClient>,
    coordinator: Arc<Coordinator>,
    classifier: IntentClassifier,
}

impl Gateway {
    /// Assembles the gateway from its collaborators
    pub fn new(
        registry: Arc<RegistryClient>,
        coordinator: Arc<Coordinator>,
        classifier: IntentClassifier,
    ) -> Self {
        Self {
            registry,
            coordinator,
            classifier,
        }
    }

    /// Union of capabilities across registered agents
    ///
    /// # Errors
    /// Returns registry transport errors.
    pub async fn capabilities(&self) -> Result<Vec<GlobalCapability>> {
        let agents = self.registry.list_agents().await?;
        let mut capabilities = Vec::new();
        for agent in agents {
            let manifest = agent.registration.manifest;
            for capability in manifest.capabilities {
                capabilities.push(GlobalCapability {
                    agent_id: manifest.agent_id.clone(),
                    verb: capability.verb,
                    description: capability.description,
                });
            }
        }
        Ok(capabilities)
    }

    /// Classifies a query without executing it
    pub async fn classify(&self, query: &str) -> RoutingDecision {
        let available = self.capabilities().await.unwrap_or_default();
        self.classifier.classify(query, &available).await
    }

    /// The unified query entrypoint
    ///
    /// # Errors
    /// Returns `bad_request` for empty queries and the underlying error for
    /// failed direct calls or aborted pipelines.
    pub async fn handle_query(&self, query: &str) -> Result<Value> {
        if query.trim().is_empty() {
            return Err(Error::bad_request("query must not be empty"));
        }
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let decision = self.classify(query).await;

        match decision.route {
            Route::Direct => {
                let agent_id = decision
                    .agent_id
                    .clone()
                    .ok_or_else(|| Error::internal("direct route without an agent"))?;
                let verb = decision
                    .capability
                    .clone()
                    .ok_or_else(|| Error::internal("direct route without a capability"))?;

                let agent = self.registry.resolve(&agent_id).await?;
                let result = agent
                    .call(&verb, decision.parameters.clone(), DIRECT_CALL_DEADLINE)
                    .await?;

                Ok(json!({
                    "request_id": request_id,
                    "intent": decision.intent,
                    "routing": "direct",
                    "agent_id": agent_id,
                    "capability": verb,
                    "result": result,
                    "confidence": decision.confidence,
                    "duration_ms": started.elapsed().as_secs_f64() * 1000.0,
                }))
            }
            Route::Coordinator => {
                let state = self.coordinator.process_request(query).await?;
                Ok(json!({
                    "request_id": request_id,
                    "intent": decision.intent,
                    "routing": "coordinator",
                    "context": state.context,
                    "result": state.results,
                    "execution_path": state.execution_path,
                    "errors": state.errors,
                    "duration_ms": started.elapsed().as_secs_f64() * 1000.0,
                }))
            }
        }
    }

    /// Direct passthrough to one agent capability
    ///
    /// # Errors
    /// Returns `not_found` for unknown agents and the remote error kind on
    /// failure.
    pub async fn call_agent(
        &self,
        agent_id: &AgentId,
        verb: &CapabilityVerb,
        input: Value,
    ) -> Result<Value> {
        let agent = self.registry.resolve(agent_id).await?;
        agent.call(verb, input, DIRECT_CALL_DEADLINE).await
    }

    /// Registry listing passthrough
    ///
    /// # Errors
    /// Returns registry transport errors.
    pub async fn agents(&self) -> Result<Value> {
        let agents = self.registry.list_agents().await?;
        Ok(json!({
            "agents": agents
                .iter()
                .map(|a| json!({
                    "agent_id": a.registration.manifest.agent_id,
                    "display_name": a.registration.manifest.display_name,
                    "status": a.status,
                    "capabilities": a.registration.manifest.capabilities.len(),
                }))
                .collect::<Vec<_>>(),
            "total_count": agents.len(),
        }))
    }
}

/// Request body for the unified query endpoint
#[derive(Debug, Deserialize)]
pub struct GatewayQueryRequest {
    /// The user query
    pub query: String,
    /// Optional caller context (informational)
    #[serde(default)]
    pub context: Option<Value>,
}

/// Request body for the per-agent passthrough
#[derive(Debug, Deserialize)]
pub struct PassthroughRequest {
    /// Capability input
    #[serde(default)]
    pub input: Value,
}

/// Builds the gateway router over shared gateway state
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/capabilities", get(capabilities))
        .route("/agents", get(agents))
        .route("/agents/{id}/{verb}", post(passthrough))
        .route("/stream", get(stream))
        .with_state(gateway)
}

async fn query(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<GatewayQueryRequest>,
) -> Result<Json<Value>> {
    Ok(Json(gateway.handle_query(&request.query).await?))
}

async fn capabilities(State(gateway): State<Arc<Gateway>>) -> Result<Json<Value>> {
    let capabilities = gateway.capabilities().await?;
    Ok(Json(json!({
        "capabilities": capabilities,
        "total_count": capabilities.len(),
    })))
}

async fn agents(State(gateway): State<Arc<Gateway>>) -> Result<Json<Value>> {
    Ok(Json(gateway.agents().await?))
}

async fn passthrough(
    State(gateway): State<Arc<Gateway>>,
    Path((id, verb)): Path<(String, String)>,
    Json(request): Json<PassthroughRequest>,
) -> Result<Json<Value>> {
    let agent_id = AgentId::try_new(id)
        .map_err(|_| Error::bad_request("agent id must be lowercase kebab-case"))?;
    let verb = CapabilityVerb::try_new(verb)
        .map_err(|_| Error::bad_request("capability verb must match domain.action"))?;
    let result = gateway.call_agent(&agent_id, &verb, request.input).await?;
    Ok(Json(json!({
        "agent_id": agent_id,
        "capability": verb,
        "result": result,
    })))
}

async fn stream(State(gateway): State<Arc<Gateway>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade
        .on_upgrade(move |socket| handle_stream(socket, gateway))
        .into_response()
}

/// WebSocket loop: each text frame is a query; responses stream as
/// `status → intent → partial* → result`, with terminal error frames on
/// failure
async fn handle_stream(mut socket: WebSocket, gateway: Arc<Gateway>) {
    info!("stream client connected");
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let query = serde_json::from_str::<Value>(&message)
            .ok()
            .and_then(|v| v["query"].as_str().map(ToString::to_string))
            .unwrap_or_default();

        if query.trim().is_empty() {
            let frame = error_frame(&Error::bad_request("query must not be empty"));
            if socket.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
            continue;
        }

        if send_json(
            &mut socket,
            json!({ "type": "status", "message": "processing query" }),
        )
        .await
        .is_err()
        {
            break;
        }

        let decision = gateway.classify(&query).await;
        if send_json(
            &mut socket,
            json!({
                "type": "intent",
                "intent": decision.intent,
                "routing": decision.route,
                "confidence": decision.confidence,
            }),
        )
        .await
        .is_err()
        {
            break;
        }

        match gateway.handle_query(&query).await {
            Ok(envelope) => {
                // Coordinator runs stream one partial per completed step.
                if let Some(results) = envelope["result"].as_object() {
                    for (step, output) in results {
                        let frame = json!({ "type": "partial", "step": step, "result": output });
                        if send_json(&mut socket, frame).await.is_err() {
                            return;
                        }
                    }
                }
                if send_json(&mut socket, json!({ "type": "result", "response": envelope }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "stream query failed");
                if socket.send(Message::Text(error_frame(&err).into())).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("stream client disconnected");
}

async fn send_json(socket: &mut WebSocket, value: Value) -> std::result::Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

fn error_frame(err: &Error) -> String {
    let envelope = ErrorEnvelope::from(err);
    json!({
        "type": "error",
        "kind": envelope.error.kind,
        "message": envelope.error.message,
    })
    .to_string()
}
