//! Integration tests for the uniform agent HTTP surface

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use steward::cache::{SemanticCache, SemanticCacheConfig};
use steward::domain_types::{AgentId, CapabilityVerb, Confidence};
use steward::llm::{Interpretation, Interpreter, ScriptedInterpreter};
use steward::manifest::Capability;
use steward::monitor::{PerformanceTracker, SlaConfig, TrackerConfig};
use steward::service::http::agent_router;
use steward::service::{AgentService, AgentServiceConfig};
use tokio::net::TcpListener;

struct TestAgent {
    addr: SocketAddr,
    service: Arc<AgentService>,
    handler_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn verb(name: &str) -> CapabilityVerb {
    CapabilityVerb::try_new(name.to_string()).unwrap()
}

fn conf(value: f64) -> Confidence {
    Confidence::try_new(value).unwrap()
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

async fn spawn_agent(
    interpreter: Arc<dyn Interpreter>,
    fallback: Option<&str>,
) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let agent_id = AgentId::try_new("mail".to_string()).unwrap();
    let cache = SemanticCache::open(
        dir.path(),
        agent_id.clone(),
        None,
        SemanticCacheConfig::default(),
    )
    .await
    .unwrap();

    let config = AgentServiceConfig {
        fallback_capability: fallback.map(verb),
        ..AgentServiceConfig::default()
    };
    let service = AgentService::new(
        agent_id,
        "Mail Agent",
        "Searches locally synced mail",
        cache,
        interpreter,
        PerformanceTracker::new(TrackerConfig::default(), SlaConfig::default()),
        config,
    );

    let handler_calls = Arc::new(AtomicUsize::new(0));
    let calls = handler_calls.clone();
    service
        .register_capability(
            Capability {
                verb: verb("mail.search"),
                description: "Search cached mail".to_string(),
                input_schema: json!({"type": "object"}),
                output_schema: json!({"type": "object"}),
                safety_annotations: vec![],
            },
            Arc::new(move |parameters: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"results": [], "echo": parameters}))
                }
            }),
        )
        .unwrap();
    service
        .register_capability(
            Capability {
                verb: verb("mail.read"),
                description: "Read one message".to_string(),
                input_schema: json!({"type": "object", "required": ["id"]}),
                output_schema: json!({"type": "object"}),
                safety_annotations: vec![],
            },
            Arc::new(|_parameters: Value| async move { Ok(json!({"body": "hello"})) }),
        )
        .unwrap();

    let service = Arc::new(service);
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = agent_router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestAgent {
        addr,
        service,
        handler_calls,
        _dir: dir,
    }
}

#[tokio::test]
async fn cached_interpretation_serves_within_budget() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;

    // Seed the cache exactly as the pipeline would have.
    let blob = serde_json::to_value(interpretation("mail.search", 0.9)).unwrap();
    agent
        .service
        .cache()
        .set("find emails about project x", &blob, conf(0.9))
        .await;

    let client = reqwest::Client::new();
    let started = std::time::Instant::now();
    let response = client
        .post(format!("http://{}/query", agent.addr))
        .json(&json!({"query": "find emails about project x"}))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["fallback_used"], false);
    assert_eq!(body["cached"], true);
    assert_eq!(agent.handler_calls.load(Ordering::SeqCst), 1);
    // Cache-served dispatch answers quickly (no interpreter in the path).
    assert!(elapsed.as_millis() < 250, "took {elapsed:?}");
}

#[tokio::test]
async fn fallback_capability_preserves_parameters() {
    let interpreter = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
        "mail.unknown",
        0.55,
    )));
    let agent = spawn_agent(interpreter, Some("mail.search")).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/query", agent.addr))
        .json(&json!({"query": "do the odd thing"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["fallback_used"], true);
    assert_eq!(body["result"]["echo"]["q"], "project x");
    assert_eq!(agent.handler_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn low_confidence_without_fallback_is_422() {
    let interpreter = Arc::new(ScriptedInterpreter::with_verdict(interpretation(
        "mail.search",
        0.5,
    )));
    let agent = spawn_agent(interpreter, None).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/query", agent.addr))
        .json(&json!({"query": "vague request"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "low_confidence");
    assert_eq!(agent.handler_calls.load(Ordering::SeqCst), 0);
    // The rejection is still one failed performance sample.
    assert_eq!(agent.service.monitor().sample_count(), 1);
}

#[tokio::test]
async fn empty_query_is_400() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/query", agent.addr))
        .json(&json!({"query": "   "}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "bad_request");
}

#[tokio::test]
async fn direct_capability_invocation_round_trips() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/capabilities/mail.read", agent.addr))
        .json(&json!({"input": {"id": "msg-1"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["output"]["body"], "hello");
    assert!(body["duration_ms"].is_number());
}

#[tokio::test]
async fn schema_violation_is_400_with_details() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/capabilities/mail.read", agent.addr))
        .json(&json!({"input": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "bad_request");
    assert!(body["error"]["details"]["violations"].is_array());
}

#[tokio::test]
async fn unknown_capability_is_404() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/capabilities/mail.missing", agent.addr))
        .json(&json!({"input": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_manifest_capabilities_and_metrics_respond() {
    let agent = spawn_agent(Arc::new(ScriptedInterpreter::default()), None).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", agent.addr);

    let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["details"]["agent_id"], "mail");

    let manifest: Value = client.get(format!("{base}/manifest")).send().await.unwrap().json().await.unwrap();
    assert_eq!(manifest["agent_id"], "mail");
    assert_eq!(manifest["capabilities"].as_array().unwrap().len(), 2);
    assert_eq!(manifest["egress_domains"].as_array().unwrap().len(), 0);

    let capabilities: Value = client.get(format!("{base}/capabilities")).send().await.unwrap().json().await.unwrap();
    assert_eq!(capabilities["capabilities"].as_array().unwrap().len(), 2);

    let metrics: Value = client.get(format!("{base}/metrics")).send().await.unwrap().json().await.unwrap();
    assert!(metrics["dashboard"]["performance_summary"]["current"].is_object());
    assert!(metrics["cache"]["l1_capacity"].is_number());
}
