//! Background cache warming
//!
//! Periodically replays a configured list of common query patterns through
//! the owning agent so the semantic cache stays hot for the queries users
//! actually make (calendar views, frequent contact lookups).

use super::AgentService;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait applied after a cycle that errored
const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// Cycle counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmingStats {
    /// Completed warming cycles
    pub cycles: u64,
    /// Patterns successfully warmed across all cycles
    pub patterns_warmed: u64,
    /// Pattern executions that errored
    pub errors: u64,
    /// Duration of the last cycle
    pub last_cycle_ms: f64,
}

/// Background service that keeps the cache warm for common patterns
pub struct CacheWarmingService {
    agent: Arc<AgentService>,
    patterns: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<WarmingStats>>,
}

impl CacheWarmingService {
    /// Creates a warming service over `agent` with the given patterns
    pub fn new(agent: Arc<AgentService>, patterns: Vec<String>, interval: Duration) -> Self {
        Self {
            agent,
            patterns,
            interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            stats: Arc::new(Mutex::new(WarmingStats::default())),
        }
    }

    /// Starts the background loop; starting twice is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock().expect("warming lock poisoned");
        if task.is_some() {
            warn!("cache warming already running");
            return;
        }

        let agent = self.agent.clone();
        let patterns = self.patterns.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();

        *task = Some(tokio::spawn(async move {
            info!(
                agent_id = %agent.agent_id(),
                patterns = patterns.len(),
                "cache warming started"
            );
            loop {
                let errored = run_cycle(&agent, &patterns, &stats).await;
                let wait = if errored { ERROR_COOLDOWN } else { interval };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
            }
            info!(agent_id = %agent.agent_id(), "cache warming stopped");
        }));
    }

    /// Stops the loop and waits for the task to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("warming lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Runs one warming cycle immediately
    pub async fn warm_now(&self) -> WarmingStats {
        run_cycle(&self.agent, &self.patterns, &self.stats).await;
        self.stats()
    }

    /// Current counters
    pub fn stats(&self) -> WarmingStats {
        self.stats.lock().expect("warming lock poisoned").clone()
    }
}

/// Executes every pattern once; returns whether any errored
async fn run_cycle(
    agent: &Arc<AgentService>,
    patterns: &[String],
    stats: &Arc<Mutex<WarmingStats>>,
) -> bool {
    let started = Instant::now();
    let mut warmed = 0u64;
    let mut errors = 0u64;

    for pattern in patterns {
        match agent.handle_query(pattern).await {
            Ok(result) if result.error.is_none() => warmed += 1,
            Ok(_) => {
                // Below-threshold patterns are not worth retrying loudly.
                debug!(pattern = %pattern, "warming pattern interpreted below threshold");
                errors += 1;
            }
            Err(err) => {
                debug!(pattern = %pattern, error = %err, "warming pattern failed");
                errors += 1;
            }
        }
    }

    let mut stats = stats.lock().expect("warming lock poisoned");
    stats.cycles += 1;
    stats.patterns_warmed += warmed;
    stats.errors += errors;
    stats.last_cycle_ms = started.elapsed().as_secs_f64() * 1000.0;
    errors > 0
}
