//! Integration tests for the registry HTTP surface and liveness probing

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use steward::domain_types::AgentId;
use steward::manifest::{AgentManifest, AgentRegistration, AgentStatus, Capability, HealthCheckConfig};
use steward::registry::http::registry_router;
use steward::registry::{AgentRegistry, RegistryConfig};
use tokio::net::TcpListener;

fn registration(id: &str, verbs: &[&str], base_url: &str) -> AgentRegistration {
    AgentRegistration {
        manifest: AgentManifest {
            agent_id: AgentId::try_new(id.to_string()).unwrap(),
            version: "1.0.0".to_string(),
            display_name: id.to_string(),
            description: format!("test agent {id}"),
            capabilities: verbs
                .iter()
                .map(|v| Capability {
                    verb: steward::domain_types::CapabilityVerb::try_new((*v).to_string())
                        .unwrap(),
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
        base_url: base_url.to_string(),
        health_endpoint: format!("{base_url}/health"),
    }
}

async fn spawn_registry() -> (SocketAddr, Arc<AgentRegistry>) {
    let registry = Arc::new(AgentRegistry::new(RegistryConfig::default()));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = registry_router(registry.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, registry)
}

/// A stub agent that serves /health and /metrics like the real surface
async fn spawn_stub_agent(healthy: bool) -> SocketAddr {
    use axum::routing::get;
    let health_body = if healthy {
        json!({"status": "healthy"})
    } else {
        json!({"status": "degraded"})
    };
    let metrics_body = json!({
        "dashboard": {
            "sla": {"overall_compliant": false},
            "performance_summary": {"trend_analysis": {"trend": "degrading"}},
        }
    });
    let router = axum::Router::new()
        .route("/health", get(move || {
            let body = health_body.clone();
            async move { axum::Json(body) }
        }))
        .route("/metrics", get(move || {
            let body = metrics_body.clone();
            async move { axum::Json(body) }
        }));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn register_list_get_unregister_round_trip() {
    let (addr, _registry) = spawn_registry().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let response = client
        .post(format!("{base}/agents"))
        .json(&registration("mail-agent", &["mail.search"], "http://127.0.0.1:1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let agents: Value = client.get(format!("{base}/agents")).send().await.unwrap().json().await.unwrap();
    assert_eq!(agents["total_count"], 1);

    let agent: Value = client
        .get(format!("{base}/agents/mail-agent"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agent["registration"]["manifest"]["agent_id"], "mail-agent");
    assert_eq!(agent["status"], "registered");

    let response = client
        .delete(format!("{base}/agents/mail-agent"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client.get(format!("{base}/agents/mail-agent")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn duplicate_registration_is_409() {
    let (addr, _registry) = spawn_registry().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let reg = registration("mail-agent", &["mail.search"], "http://127.0.0.1:1");

    assert_eq!(
        client.post(format!("{base}/agents")).json(&reg).send().await.unwrap().status(),
        201
    );
    let response = client.post(format!("{base}/agents")).json(&reg).send().await.unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "conflict");
}

#[tokio::test]
async fn capability_discovery_covers_every_advertised_verb() {
    let (addr, _registry) = spawn_registry().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    client
        .post(format!("{base}/agents"))
        .json(&registration(
            "mail-agent",
            &["mail.search", "mail.read"],
            "http://127.0.0.1:1",
        ))
        .send()
        .await
        .unwrap();

    for verb in ["mail.search", "mail.read"] {
        let body: Value = client
            .get(format!("{base}/capabilities/{verb}/agents"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["agents"].as_array().unwrap().len(), 1, "verb {verb}");
    }

    let body: Value = client
        .get(format!("{base}/capabilities/calendar.read/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["agents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn egress_domains_are_rejected() {
    let (addr, _registry) = spawn_registry().await;
    let client = reqwest::Client::new();

    let mut reg = registration("leaky-agent", &["mail.search"], "http://127.0.0.1:1");
    reg.manifest.egress_domains = vec!["api.example.com".to_string()];
    let response = client
        .post(format!("http://{addr}/agents"))
        .json(&reg)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn probe_against_live_agent_marks_healthy() {
    let (_addr, registry) = spawn_registry().await;
    let agent_addr = spawn_stub_agent(true).await;
    let id = AgentId::try_new("stub-agent".to_string()).unwrap();

    registry
        .register(registration(
            "stub-agent",
            &["stub.ping"],
            &format!("http://{agent_addr}"),
        ))
        .unwrap();

    registry.probe_agent(&id).await;
    assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Healthy);
    assert!(registry.get_agent(&id).unwrap().last_heartbeat_at_ms.is_some());
}

#[tokio::test]
async fn probe_against_degraded_agent_marks_degraded() {
    let (_addr, registry) = spawn_registry().await;
    let agent_addr = spawn_stub_agent(false).await;
    let id = AgentId::try_new("stub-agent".to_string()).unwrap();

    registry
        .register(registration(
            "stub-agent",
            &["stub.ping"],
            &format!("http://{agent_addr}"),
        ))
        .unwrap();

    registry.probe_agent(&id).await;
    assert_eq!(registry.get_agent(&id).unwrap().status, AgentStatus::Degraded);
}

#[tokio::test]
async fn dashboard_aggregates_live_and_dead_agents() {
    let (addr, registry) = spawn_registry().await;
    let live_addr = spawn_stub_agent(true).await;

    registry
        .register(registration(
            "live-agent",
            &["live.ping"],
            &format!("http://{live_addr}"),
        ))
        .unwrap();
    registry
        .register(registration("dead-agent", &["dead.ping"], "http://127.0.0.1:1"))
        .unwrap();

    let client = reqwest::Client::new();
    let dashboard: Value = client
        .get(format!("http://{addr}/system/dashboard"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(dashboard["performance_overview"]["monitored_agents"], 1);
    // The stub reports SLA violation + degrading trend.
    assert_eq!(dashboard["performance_overview"]["sla_violations"], 1);
    assert_eq!(dashboard["performance_overview"]["degrading_agents"], 1);
    assert!(dashboard["agent_details"]["dead-agent"]["error"].is_string());
    assert!(!dashboard["system_recommendations"].as_array().unwrap().is_empty());

    let health: Value = client
        .get(format!("http://{addr}/system/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["total_agents"], 2);
}
