//! Uniform HTTP surface shared by every agent
//!
//! `GET /health`, `GET /capabilities`, `POST /capabilities/{verb}`,
//! `POST /query`, `GET /manifest`, `GET /metrics`. All responses are JSON;
//! errors use the `{error: {kind, message, details?}}` envelope.

use super::{AgentService, ConfidenceResult};
use crate::domain_types::CapabilityVerb;
use crate::error::{Error, Result};
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Request body for direct capability invocation
#[derive(Debug, Deserialize)]
pub struct CapabilityRequest {
    /// Input matching the capability's input schema
    #[serde(default)]
    pub input: Value,
}

/// Response body for direct capability invocation
#[derive(Debug, Serialize)]
pub struct CapabilityResponse {
    /// Handler output
    pub output: Value,
    /// Handler wall time
    pub duration_ms: f64,
}

/// Request body for the natural-language entrypoint
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// The user query
    pub query: String,
    /// Optional caller-supplied context (currently informational)
    #[serde(default)]
    pub context: Option<Value>,
}

/// Builds the agent router over shared service state
pub fn agent_router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/capabilities", get(list_capabilities))
        .route("/capabilities/{verb}", post(execute_capability))
        .route("/query", post(query))
        .route("/manifest", get(manifest))
        .route("/metrics", get(metrics))
        .with_state(service)
}

async fn health(State(service): State<Arc<AgentService>>) -> Json<Value> {
    Json(service.health())
}

async fn list_capabilities(State(service): State<Arc<AgentService>>) -> Json<Value> {
    let manifest = service.generate_manifest();
    Json(json!({ "capabilities": manifest.capabilities }))
}

async fn execute_capability(
    State(service): State<Arc<AgentService>>,
    Path(verb): Path<String>,
    Json(request): Json<CapabilityRequest>,
) -> Result<Json<CapabilityResponse>> {
    let verb = CapabilityVerb::try_new(verb)
        .map_err(|_| Error::bad_request("capability verb must match domain.action"))?;
    let (output, duration_ms) = service.execute_capability(&verb, request.input).await?;
    Ok(Json(CapabilityResponse { output, duration_ms }))
}

async fn query(
    State(service): State<Arc<AgentService>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ConfidenceResult>> {
    let result = service.handle_query(&request.query).await?;
    if result.error.as_deref() == Some("low_confidence") {
        return Err(Error::low_confidence(format!(
            "interpretation confidence {:.2} is below the agent threshold and no fallback is configured",
            result.confidence.value()
        ))
        .with_details(json!({ "confidence": result.confidence })));
    }
    Ok(Json(result))
}

async fn manifest(State(service): State<Arc<AgentService>>) -> Json<Value> {
    Json(json!(service.generate_manifest()))
}

async fn metrics(State(service): State<Arc<AgentService>>) -> Result<Json<Value>> {
    let dashboard = service.monitor().dashboard();
    let cache = service.cache().stats().await?;
    Ok(Json(json!({
        "agent_id": service.agent_id(),
        "dashboard": dashboard,
        "cache": cache,
    })))
}
