//! End-to-end tests: gateway → registry → agent constellation

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use steward::coordinator::{Coordinator, PolicyAction, PolicyEngine};
use steward::cache::{SemanticCache, SemanticCacheConfig};
use steward::domain_types::{AgentId, CapabilityVerb, Confidence};
use steward::gateway::{gateway_router, Gateway, IntentClassifier};
use steward::llm::{Interpretation, ScriptedInterpreter};
use steward::manifest::{AgentRegistration, Capability};
use steward::monitor::{PerformanceTracker, SlaConfig, TrackerConfig};
use steward::registry::http::registry_router;
use steward::registry::{AgentRegistry, RegistryClient, RegistryConfig};
use steward::service::http::agent_router;
use steward::service::{AgentService, AgentServiceConfig};
use tokio::net::TcpListener;

struct Constellation {
    gateway_addr: SocketAddr,
    registry_addr: SocketAddr,
    _dir: tempfile::TempDir,
}

async fn serve_on_ephemeral(router: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_constellation(policy: Arc<PolicyEngine>) -> Constellation {
    // Registry.
    let registry = Arc::new(AgentRegistry::new(RegistryConfig::default()));
    let registry_addr = serve_on_ephemeral(registry_router(registry.clone())).await;
    let registry_url = format!("http://{registry_addr}");

    // Mail agent with a scripted interpreter and a real handler.
    let dir = tempfile::tempdir().unwrap();
    let agent_id = AgentId::try_new("mail-agent".to_string()).unwrap();
    let cache = SemanticCache::open(
        dir.path(),
        agent_id.clone(),
        None,
        SemanticCacheConfig::default(),
    )
    .await
    .unwrap();
    let interpreter = Arc::new(ScriptedInterpreter::with_verdict(Interpretation {
        capability: "mail.search".to_string(),
        parameters: json!({"query": "inbox"}),
        confidence: Confidence::try_new(0.9).unwrap(),
        reasoning: None,
        unsupported: false,
        error: None,
    }));
    let service = AgentService::new(
        agent_id.clone(),
        "Mail Agent",
        "Searches locally synced mail",
        cache,
        interpreter,
        PerformanceTracker::new(TrackerConfig::default(), SlaConfig::default()),
        AgentServiceConfig::default(),
    );
    service
        .register_capability(
            Capability {
                verb: CapabilityVerb::try_new("mail.search".to_string()).unwrap(),
                description: "Search cached mail".to_string(),
                input_schema: json!({"type": "object"}),
                output_schema: json!({"type": "object"}),
                safety_annotations: vec![],
            },
            Arc::new(|parameters: Value| async move {
                Ok(json!({"count": 1, "results": [{"id": "msg-1"}], "echo": parameters}))
            }),
        )
        .unwrap();
    let service = Arc::new(service);
    let agent_addr = serve_on_ephemeral(agent_router(service.clone())).await;

    // Register the agent with its live base URL.
    let client = RegistryClient::new(registry_url.clone());
    client
        .register(&AgentRegistration {
            manifest: service.generate_manifest(),
            base_url: format!("http://{agent_addr}"),
            health_endpoint: format!("http://{agent_addr}/health"),
        })
        .await
        .unwrap();

    // Gateway over the registry, keyword classifier only.
    let registry_client = Arc::new(RegistryClient::new(registry_url));
    let coordinator = Arc::new(Coordinator::new(Some(registry_client.clone()), policy));
    let gateway = Arc::new(Gateway::new(
        registry_client,
        coordinator,
        IntentClassifier::new(None),
    ));
    let gateway_addr = serve_on_ephemeral(gateway_router(gateway)).await;

    Constellation {
        gateway_addr,
        registry_addr,
        _dir: dir,
    }
}

#[test_log::test(tokio::test)]
async fn mail_query_is_orchestrated_through_the_pipeline() {
    let constellation = spawn_constellation(Arc::new(PolicyEngine::new())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/query", constellation.gateway_addr))
        .json(&json!({"query": "check my email"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["routing"], "coordinator");
    assert_eq!(body["intent"], "mail_operation");
    assert_eq!(
        body["execution_path"],
        json!(["router", "planner", "executor", "reviewer"])
    );
    assert_eq!(body["context"]["plan"], json!(["mail.search", "process_results"]));
    assert_eq!(body["errors"].as_array().unwrap().len(), 0);
    assert_eq!(body["result"]["mail.search"]["status"], "completed");
    assert_eq!(body["result"]["mail.search"]["agent_id"], "mail-agent");
    assert_eq!(body["result"]["process_results"]["status"], "completed");
}

#[tokio::test]
async fn capability_union_and_agent_listing() {
    let constellation = spawn_constellation(Arc::new(PolicyEngine::new())).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", constellation.gateway_addr);

    let capabilities: Value = client
        .get(format!("{base}/capabilities"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(capabilities["total_count"], 1);
    assert_eq!(capabilities["capabilities"][0]["verb"], "mail.search");
    assert_eq!(capabilities["capabilities"][0]["agent_id"], "mail-agent");

    let agents: Value = client
        .get(format!("{base}/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents["total_count"], 1);
    assert_eq!(agents["agents"][0]["agent_id"], "mail-agent");
}

#[tokio::test]
async fn passthrough_invokes_the_agent_directly() {
    let constellation = spawn_constellation(Arc::new(PolicyEngine::new())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "http://{}/agents/mail-agent/mail.search",
            constellation.gateway_addr
        ))
        .json(&json!({"input": {"query": "invoices"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["count"], 1);
    assert_eq!(body["result"]["echo"]["query"], "invoices");
}

#[tokio::test]
async fn passthrough_to_unknown_agent_is_404() {
    let constellation = spawn_constellation(Arc::new(PolicyEngine::new())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "http://{}/agents/ghost-agent/ghost.walk",
            constellation.gateway_addr
        ))
        .json(&json!({"input": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[test_log::test(tokio::test)]
async fn policy_denial_surfaces_as_403() {
    let policy = Arc::new(PolicyEngine::new());
    policy.add_rule(
        "no mail search",
        PolicyAction::Deny,
        [("operation".to_string(), "mail.search".to_string())]
            .into_iter()
            .collect(),
        100,
    );
    let constellation = spawn_constellation(policy).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/query", constellation.gateway_addr))
        .json(&json!({"query": "check my email"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "forbidden");
}

#[tokio::test]
async fn registry_stays_consistent_after_agent_queries() {
    let constellation = spawn_constellation(Arc::new(PolicyEngine::new())).await;
    let client = reqwest::Client::new();

    // Drive a query through the constellation, then confirm discovery
    // still lists the agent for its advertised verb.
    client
        .post(format!("http://{}/query", constellation.gateway_addr))
        .json(&json!({"query": "check my email"}))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!(
            "http://{}/capabilities/mail.search/agents",
            constellation.registry_addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["agents"].as_array().unwrap().len(), 1);
}
