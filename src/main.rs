//! Steward service binary
//!
//! One binary, three planes: `steward registry`, `steward gateway`, and
//! `steward agent` (a demo mail agent exercising the full agent service
//! stack). Each subcommand constructs its components explicitly, binds
//! their lifecycles to the server, and tears them down on shutdown.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 unrecoverable startup
//! failure.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use steward::cache::l2::HttpKv;
use steward::cache::{SemanticCache, SemanticCacheConfig};
use steward::config::{AgentMode, StewardConfig};
use steward::coordinator::{Coordinator, PolicyEngine};
use steward::domain_types::{AgentId, CapabilityVerb};
use steward::error::Error;
use steward::gateway::{gateway_router, Gateway, IntentClassifier};
use steward::llm::{Interpreter, LlmClient, LlmInterpreter};
use steward::manifest::{AgentRegistration, Capability};
use steward::monitor::{PerformanceTracker, SlaConfig, TrackerConfig};
use steward::registry::http::registry_router;
use steward::registry::{AgentRegistry, RegistryClient, RegistryConfig};
use steward::service::http::agent_router;
use steward::service::warming::CacheWarmingService;
use steward::service::{AgentService, AgentServiceConfig};
use steward::sync::{FixtureAdapter, SourceRecord, SyncStore, SyncWorker, SyncWorkerConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "steward", version, about = "Local-first multi-agent assistant platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent registry
    Registry {
        /// Listen port
        #[arg(long, default_value_t = 9001)]
        port: u16,
    },
    /// Run the gateway (embeds the coordinator)
    Gateway {
        /// Listen port; defaults to GATEWAY_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the demo mail agent
    Agent {
        /// Agent identifier
        #[arg(long, default_value = "mail-agent")]
        id: String,
        /// Listen port
        #[arg(long, default_value_t = 9100)]
        port: u16,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match StewardConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };

    let outcome = match cli.command {
        Command::Registry { port } => run_registry(port).await,
        Command::Gateway { port } => run_gateway(&config, port).await,
        Command::Agent { id, port } => run_agent(&config, &id, port).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "unrecoverable startup failure");
            ExitCode::from(2)
        }
    }
}

async fn bind(port: u16) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let addr = listener.local_addr().context("cannot read bound address")?;
    Ok((listener, addr))
}

async fn serve(listener: TcpListener, router: axum::Router) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server failed")
}

async fn run_registry(port: u16) -> anyhow::Result<()> {
    let registry = Arc::new(AgentRegistry::new(RegistryConfig::default()));
    registry.start_prober();

    let (listener, addr) = bind(port).await?;
    info!(%addr, "registry listening");
    let result = serve(listener, registry_router(registry.clone())).await;

    registry.stop().await;
    result
}

async fn run_gateway(config: &StewardConfig, port: Option<u16>) -> anyhow::Result<()> {
    let registry = Arc::new(RegistryClient::new(config.registry_url.clone()));
    let coordinator = Arc::new(Coordinator::new(
        Some(registry.clone()),
        Arc::new(PolicyEngine::new()),
    ));

    let llm = LlmClient::new(
        config.llm_base_url.clone(),
        config.llm_model.clone(),
        config.llm_timeout,
    );
    if !llm.model_available().await {
        warn!("model unavailable; intent classification falls back to keywords");
    }
    let classifier =
        IntentClassifier::new(Some(Arc::new(LlmInterpreter::new(llm)) as Arc<dyn Interpreter>));

    let gateway = Arc::new(Gateway::new(registry, coordinator, classifier));

    let (listener, addr) = bind(port.unwrap_or(config.gateway_port)).await?;
    info!(%addr, "gateway listening");
    serve(listener, gateway_router(gateway)).await
}

async fn run_agent(config: &StewardConfig, id: &str, port: u16) -> anyhow::Result<()> {
    let agent_id = AgentId::try_new(id.to_string())
        .map_err(|_| anyhow::anyhow!("agent id must be lowercase kebab-case"))?;

    // Tiered cache; L2 only when a remote KV is configured.
    let l2 = config
        .cache_l2_url
        .as_ref()
        .map(|url| Arc::new(HttpKv::new(url.clone())) as Arc<dyn steward::cache::l2::RemoteKv>);
    let cache = SemanticCache::open(
        &config.cache_dir,
        agent_id.clone(),
        l2,
        SemanticCacheConfig::default(),
    )
    .await?;

    let llm = LlmClient::new(
        config.llm_base_url.clone(),
        config.llm_model.clone(),
        config.llm_timeout,
    );
    if !llm.model_available().await {
        warn!("model unavailable; queries degrade to the fallback capability");
    }
    let interpreter: Arc<dyn Interpreter> = Arc::new(LlmInterpreter::new(llm));

    // Local store of upstream mail plus its synchronizer. Host adapters are
    // wired by deployments; this binary ships the deterministic fixture
    // source, so live mode degrades to fixtures with a warning.
    let store = Arc::new(SyncStore::open(&config.cache_dir, &agent_id, "mail").await?);
    if config.mode == AgentMode::Live {
        warn!("no host source adapter in this build; serving fixture data");
    }
    let adapter = Arc::new(FixtureAdapter::new(demo_mailbox()));
    let worker = Arc::new(SyncWorker::new(
        store.clone(),
        adapter,
        SyncWorkerConfig::default(),
    ));
    match config.mode {
        // Demo: one synchronous fixture load, no background worker.
        AgentMode::Demo => {
            let outcome = worker.force_sync(None).await;
            info!(records = outcome.records_synced, "fixtures loaded");
        }
        AgentMode::Live => worker.start(),
    }

    let service_config = AgentServiceConfig {
        min_confidence: config.min_confidence,
        fallback_capability: CapabilityVerb::try_new("mail.search".to_string()).ok(),
        data_scopes: vec!["mail:inbox".to_string(), "mail:sent".to_string()],
        ..AgentServiceConfig::default()
    };
    let service = AgentService::new(
        agent_id.clone(),
        "Mail Agent",
        "Searches and reads locally synced mail",
        cache,
        interpreter,
        PerformanceTracker::new(TrackerConfig::default(), SlaConfig::default()),
        service_config,
    )
    .with_context_fn(|| {
        "Mail agent over a locally synced mailbox. Good at searching messages by \
         keyword, sender, or time range, and reading individual messages."
            .to_string()
    })
    .with_registry(Arc::new(RegistryClient::new(config.registry_url.clone())));

    register_mail_capabilities(&service, store.clone())?;
    let service = Arc::new(service);

    let warming = CacheWarmingService::new(
        service.clone(),
        vec![
            "emails today".to_string(),
            "unread emails".to_string(),
            "recent emails".to_string(),
        ],
        std::time::Duration::from_secs(3600),
    );
    warming.start();

    let (listener, addr) = bind(port).await?;
    info!(%addr, agent_id = %agent_id, "agent listening");

    // Best-effort registration; the agent serves even when the registry is
    // down and can be registered later.
    let registry_client = RegistryClient::new(config.registry_url.clone());
    let registration = AgentRegistration {
        manifest: service.generate_manifest(),
        base_url: format!("http://{addr}"),
        health_endpoint: format!("http://{addr}/health"),
    };
    if let Err(err) = registry_client.register(&registration).await {
        warn!(error = %err, "registry registration failed; continuing unregistered");
    }

    let result = serve(listener, agent_router(service.clone())).await;

    if let Err(err) = registry_client.unregister(&agent_id).await {
        warn!(error = %err, "registry deregistration failed");
    }
    warming.stop().await;
    worker.stop().await;
    service.cache().close().await;
    store.close().await;
    result
}

/// Registers the demo mail capabilities over the local store
fn register_mail_capabilities(
    service: &AgentService,
    store: Arc<SyncStore>,
) -> anyhow::Result<()> {
    use serde_json::{json, Value};

    let search_store = store.clone();
    service.register_capability(
        Capability {
            verb: CapabilityVerb::try_new("mail.search".to_string())
                .expect("mail.search is a valid verb"),
            description: "Search locally synced mail by keyword".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "mailbox": {"type": "string"}
                }
            }),
            output_schema: json!({
                "type": "object",
                "properties": {"results": {"type": "array"}, "count": {"type": "integer"}}
            }),
            safety_annotations: vec!["read-only".to_string()],
        },
        Arc::new(move |parameters: Value| {
            let store = search_store.clone();
            async move {
                let needle = parameters["query"]
                    .as_str()
                    .or_else(|| parameters["q"].as_str())
                    .unwrap_or_default()
                    .to_lowercase();
                let mailbox = parameters["mailbox"].as_str().unwrap_or("inbox").to_string();
                let limit = parameters["limit"].as_u64().unwrap_or(20).min(200) as u32;

                let records = store.get_records(&mailbox, 200, 0, None).await?;
                let results: Vec<Value> = records
                    .into_iter()
                    .filter(|r| {
                        needle.is_empty()
                            || r.payload.to_string().to_lowercase().contains(&needle)
                    })
                    .take(limit as usize)
                    .map(|r| {
                        json!({
                            "id": r.source_id,
                            "mailbox": r.collection,
                            "message": r.payload,
                            "received_at_ms": r.received_at_ms,
                        })
                    })
                    .collect();
                Ok(json!({ "count": results.len(), "results": results }))
            }
        }),
    )?;

    let read_store = store;
    service.register_capability(
        Capability {
            verb: CapabilityVerb::try_new("mail.read".to_string())
                .expect("mail.read is a valid verb"),
            description: "Read one locally synced message by id".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string"}, "mailbox": {"type": "string"}}
            }),
            output_schema: json!({"type": "object"}),
            safety_annotations: vec!["read-only".to_string()],
        },
        Arc::new(move |parameters: Value| {
            let store = read_store.clone();
            async move {
                let id = parameters["id"].as_str().unwrap_or_default().to_string();
                let mailbox = parameters["mailbox"].as_str().unwrap_or("inbox").to_string();
                let records = store.get_records(&mailbox, 500, 0, None).await?;
                records
                    .into_iter()
                    .find(|r| r.source_id == id)
                    .map(|r| json!({ "id": r.source_id, "message": r.payload }))
                    .ok_or_else(|| Error::not_found(format!("no message with id {id}")))
            }
        }),
    )?;

    Ok(())
}

/// Deterministic demo mailbox content
fn demo_mailbox() -> Vec<SourceRecord> {
    use chrono::{Duration, Utc};
    use serde_json::json;

    let now = Utc::now();
    vec![
        SourceRecord {
            source_id: "msg-001".to_string(),
            collection: "inbox".to_string(),
            payload: json!({
                "subject": "Project X status update",
                "from": "jane@example.com",
                "snippet": "The project x milestone review is on Friday.",
            }),
            received_at: now - Duration::hours(30),
        },
        SourceRecord {
            source_id: "msg-002".to_string(),
            collection: "inbox".to_string(),
            payload: json!({
                "subject": "Invoice 2041",
                "from": "billing@example.com",
                "snippet": "Your invoice for March is attached.",
            }),
            received_at: now - Duration::hours(6),
        },
        SourceRecord {
            source_id: "msg-003".to_string(),
            collection: "sent".to_string(),
            payload: json!({
                "subject": "Re: Project X status update",
                "to": "jane@example.com",
                "snippet": "Friday works, see you then.",
            }),
            received_at: now - Duration::hours(5),
        },
    ]
}
