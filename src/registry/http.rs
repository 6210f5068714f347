//! Registry HTTP surface
//!
//! `POST /agents`, `DELETE /agents/{id}`, `GET /agents`,
//! `GET /agents/{id}`, `GET /capabilities/{verb}/agents`,
//! `GET /system/health`, `GET /system/dashboard`.

use super::AgentRegistry;
use crate::domain_types::{AgentId, CapabilityVerb};
use crate::error::{Error, Result};
use crate::manifest::AgentRegistration;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;

/// Builds the registry router over shared registry state
pub fn registry_router(registry: Arc<AgentRegistry>) -> Router {
    Router::new()
        .route("/agents", post(register_agent).get(list_agents))
        .route("/agents/{id}", get(get_agent).delete(unregister_agent))
        .route("/capabilities/{verb}/agents", get(agents_for_capability))
        .route("/system/health", get(system_health))
        .route("/system/dashboard", get(system_dashboard))
        .with_state(registry)
}

async fn register_agent(
    State(registry): State<Arc<AgentRegistry>>,
    Json(registration): Json<AgentRegistration>,
) -> Result<(StatusCode, Json<Value>)> {
    let agent_id = registration.manifest.agent_id.clone();
    registry.register(registration)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "agent_id": agent_id, "status": "registered" })),
    ))
}

async fn unregister_agent(
    State(registry): State<Arc<AgentRegistry>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let agent_id = parse_agent_id(&id)?;
    registry.unregister(&agent_id)?;
    Ok(Json(json!({ "agent_id": agent_id, "status": "unregistered" })))
}

async fn list_agents(State(registry): State<Arc<AgentRegistry>>) -> Json<Value> {
    let agents = registry.list_agents();
    Json(json!({ "agents": agents, "total_count": agents.len() }))
}

async fn get_agent(
    State(registry): State<Arc<AgentRegistry>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let agent_id = parse_agent_id(&id)?;
    let agent = registry
        .get_agent(&agent_id)
        .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))?;
    Ok(Json(json!(agent)))
}

async fn agents_for_capability(
    State(registry): State<Arc<AgentRegistry>>,
    Path(verb): Path<String>,
) -> Result<Json<Value>> {
    let verb = CapabilityVerb::try_new(verb)
        .map_err(|_| Error::bad_request("capability verb must match domain.action"))?;
    let agents = registry.find_agents_for_capability(&verb);
    Ok(Json(json!({ "verb": verb, "agents": agents })))
}

async fn system_health(State(registry): State<Arc<AgentRegistry>>) -> Json<Value> {
    Json(json!(registry.system_health()))
}

async fn system_dashboard(State(registry): State<Arc<AgentRegistry>>) -> Json<Value> {
    Json(registry.enhanced_dashboard().await)
}

fn parse_agent_id(raw: &str) -> Result<AgentId> {
    AgentId::try_new(raw.to_string())
        .map_err(|_| Error::bad_request("agent id must be lowercase kebab-case"))
}
