//! Registry client and remote agent handles
//!
//! Callers never assemble agent URLs from conventions: the registry hands
//! out `RemoteAgent` values that carry the manifest and know how to invoke
//! capabilities with a deadline.

use crate::domain_types::{AgentId, CapabilityVerb};
use crate::error::{Error, ErrorKind, Result};
use crate::manifest::{AgentManifest, AgentRegistration};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Decodes an error envelope from a non-success response, falling back to
/// a status-derived kind
async fn decode_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let fallback_kind = match status.as_u16() {
        400 => ErrorKind::BadRequest,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        422 => ErrorKind::LowConfidence,
        429 => ErrorKind::ResourceExhausted,
        503 => ErrorKind::UpstreamUnavailable,
        504 => ErrorKind::UpstreamTimeout,
        _ => ErrorKind::Internal,
    };

    match response.json::<crate::error::ErrorEnvelope>().await {
        Ok(envelope) => {
            let mut err = Error::new(envelope.error.kind, envelope.error.message);
            if let Some(details) = envelope.error.details {
                err = err.with_details(details);
            }
            err
        }
        Err(_) => Error::new(fallback_kind, format!("remote returned {status}")),
    }
}

/// Wire view of a registered agent, as served by the registry
#[derive(Debug, Clone, Deserialize)]
pub struct AgentView {
    /// The agent's registration
    pub registration: AgentRegistration,
    /// Current liveness standing (string form)
    #[serde(default)]
    pub status: Option<String>,
}

/// A handle to one live agent: its manifest plus a deadline-bounded call
/// surface
#[derive(Clone)]
pub struct RemoteAgent {
    http: reqwest::Client,
    manifest: AgentManifest,
    base_url: String,
}

impl RemoteAgent {
    fn new(http: reqwest::Client, registration: AgentRegistration) -> Self {
        Self {
            http,
            base_url: registration.base_url.trim_end_matches('/').to_string(),
            manifest: registration.manifest,
        }
    }

    /// The agent's advertised manifest
    pub fn manifest(&self) -> &AgentManifest {
        &self.manifest
    }

    /// The agent's base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Invokes a capability with the given deadline
    ///
    /// # Errors
    /// Returns `upstream_timeout` on deadline, the remote's own error kind
    /// when it answered with an error envelope, or `upstream_unavailable`
    /// on transport failure.
    pub async fn call(
        &self,
        verb: &CapabilityVerb,
        parameters: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let url = format!("{}/capabilities/{verb}", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(&json!({ "input": parameters }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    Error::upstream_timeout(format!(
                        "capability {verb} exceeded {}ms",
                        deadline.as_millis()
                    ))
                } else {
                    Error::from(err)
                }
            })?;

        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        let body: Value = response.json().await?;
        Ok(body.get("output").cloned().unwrap_or(body))
    }

    /// Sends a natural-language query to the agent
    ///
    /// # Errors
    /// Same classification as [`RemoteAgent::call`].
    pub async fn query(&self, query: &str, deadline: Duration) -> Result<Value> {
        let url = format!("{}/query", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetches the agent's metrics dashboard
    ///
    /// # Errors
    /// Returns transport or remote errors.
    pub async fn metrics(&self, deadline: Duration) -> Result<Value> {
        let url = format!("{}/metrics", self.base_url);
        let response = self.http.get(&url).timeout(deadline).send().await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}

/// HTTP client for the registry service
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Creates a client against the registry at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Registers an agent (`POST /agents`)
    ///
    /// # Errors
    /// Returns the registry's error kind (`conflict` on duplicates).
    pub async fn register(&self, registration: &AgentRegistration) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/agents", self.base_url))
            .json(registration)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(())
    }

    /// Unregisters an agent (`DELETE /agents/{id}`)
    ///
    /// # Errors
    /// Returns `not_found` for unknown agents.
    pub async fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/agents/{agent_id}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(())
    }

    /// Lists registrations (`GET /agents`)
    ///
    /// # Errors
    /// Returns transport or registry errors.
    pub async fn list_agents(&self) -> Result<Vec<AgentView>> {
        let response = self
            .http
            .get(format!("{}/agents", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        let body: Value = response.json().await?;
        let agents = body
            .get("agents")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(agents)?)
    }

    /// Resolves one agent into a callable handle (`GET /agents/{id}`)
    ///
    /// # Errors
    /// Returns `not_found` for unknown agents.
    pub async fn resolve(&self, agent_id: &AgentId) -> Result<RemoteAgent> {
        let response = self
            .http
            .get(format!("{}/agents/{agent_id}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        let view: AgentView = response.json().await?;
        Ok(RemoteAgent::new(self.http.clone(), view.registration))
    }

    /// Handles for every agent advertising `verb`
    /// (`GET /capabilities/{verb}/agents`)
    ///
    /// # Errors
    /// Returns transport or registry errors.
    pub async fn agents_for_capability(
        &self,
        verb: &CapabilityVerb,
    ) -> Result<Vec<RemoteAgent>> {
        let response = self
            .http
            .get(format!("{}/capabilities/{verb}/agents", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        let body: Value = response.json().await?;
        let views: Vec<AgentView> =
            serde_json::from_value(body.get("agents").cloned().unwrap_or_else(|| json!([])))?;
        Ok(views
            .into_iter()
            .map(|view| RemoteAgent::new(self.http.clone(), view.registration))
            .collect())
    }

    /// System health counts (`GET /system/health`)
    ///
    /// # Errors
    /// Returns transport or registry errors.
    pub async fn system_health(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/system/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Aggregated dashboard (`GET /system/dashboard`)
    ///
    /// # Errors
    /// Returns transport or registry errors.
    pub async fn system_dashboard(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/system/dashboard", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}
