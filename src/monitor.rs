//! Performance tracking and health monitoring
//!
//! Every capability execution records one sample into a bounded ring.
//! Aggregates (success rate, exact percentiles, throughput), SLA compliance,
//! and trend detection are computed on demand over a recency window. Alerts
//! fire on edge transitions only: a violated SLA produces one alert when it
//! starts failing and one recovery alert when it stops.

use crate::domain_types::RingCapacity;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded operation
#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    at_ms: i64,
    duration_ms: f64,
    success: bool,
    capability: Option<String>,
}

/// Direction of recent latency movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    InsufficientData,
}

/// Aggregates over the metrics window; derived, never stored
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetrics {
    /// Samples in the window
    pub sample_count: usize,
    /// Percentage of successful operations
    pub success_rate_percent: f64,
    /// Mean latency
    pub avg_ms: f64,
    /// Exact 50th percentile latency
    pub p50_ms: f64,
    /// Exact 95th percentile latency
    pub p95_ms: f64,
    /// Exact 99th percentile latency
    pub p99_ms: f64,
    /// Operations per minute over the window span
    pub throughput_ops_per_min: f64,
    /// Sample counts by capability verb, where recorded
    pub by_capability: std::collections::BTreeMap<String, usize>,
}

impl AggregatedMetrics {
    fn empty() -> Self {
        Self {
            sample_count: 0,
            success_rate_percent: 100.0,
            avg_ms: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            throughput_ops_per_min: 0.0,
            by_capability: std::collections::BTreeMap::new(),
        }
    }
}

/// Per-agent SLA thresholds
#[derive(Debug, Clone, Serialize)]
pub struct SlaConfig {
    /// Response time ceiling
    pub response_time_sla_ms: f64,
    /// Success rate floor, percent
    pub min_success_rate_percent: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            response_time_sla_ms: 5000.0,
            min_success_rate_percent: 95.0,
        }
    }
}

/// One metric's standing against its threshold
#[derive(Debug, Clone, Serialize)]
pub struct MetricCompliance {
    /// Current observed value
    pub current: f64,
    /// Configured threshold
    pub threshold: f64,
    /// Whether the metric is within SLA
    pub compliant: bool,
}

/// SLA compliance verdict across metrics
#[derive(Debug, Clone, Serialize)]
pub struct SlaCompliance {
    /// Average latency against the response-time SLA
    pub response_time_sla: MetricCompliance,
    /// Success rate against its floor
    pub success_rate_sla: MetricCompliance,
    /// True only when every metric complies
    pub overall_compliant: bool,
}

/// Alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlaViolation,
    PerformanceDegradation,
    Recovery,
}

/// An edge-transition alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Category
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Human-readable description
    pub message: String,
    /// Wall-clock time, unix milliseconds
    pub at_ms: i64,
}

/// Alert counters by category
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertCounts {
    /// SLA violations observed
    pub sla_violation: u64,
    /// Degradation transitions observed
    pub performance_degradation: u64,
    /// Recoveries observed
    pub recovery: u64,
}

/// Trend detail alongside the verdict
#[derive(Debug, Clone, Serialize)]
pub struct TrendAnalysis {
    /// Direction verdict
    pub trend: Trend,
    /// Mean latency of the earlier window half
    pub earlier_half_avg_ms: f64,
    /// Mean latency of the later window half
    pub later_half_avg_ms: f64,
}

/// The on-demand dashboard view
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    /// Current aggregates and trend
    pub performance_summary: PerformanceSummary,
    /// SLA standing
    pub sla: SlaCompliance,
    /// Recent alerts and lifetime counts
    pub alerts: AlertSummary,
    /// Deterministic, actionable recommendations
    pub recommendations: Vec<String>,
}

/// Aggregates plus trend, nested in the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    /// Window aggregates
    pub current: AggregatedMetrics,
    /// Trend verdict and halves
    pub trend_analysis: TrendAnalysis,
}

/// Recent alerts plus counters
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    /// Most recent alerts, newest last
    pub recent: Vec<Alert>,
    /// Lifetime counts by category
    pub counts: AlertCounts,
}

/// Tuning for the tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Hard bound on retained samples
    pub ring_capacity: RingCapacity,
    /// Sample-count window for aggregates
    pub window_samples: usize,
    /// Time window for aggregates
    pub window_duration: Duration,
    /// Relative latency change that flips the trend verdict, percent
    pub degradation_threshold_percent: f64,
    /// Multiplier over baseline p95 that arms degradation alerts
    pub degradation_p95_factor: f64,
    /// Alerts retained for the dashboard
    pub max_recent_alerts: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: RingCapacity::try_new(1000).expect("1000 is a valid ring size"),
            window_samples: 200,
            window_duration: Duration::from_secs(300),
            degradation_threshold_percent: 25.0,
            degradation_p95_factor: 1.5,
            max_recent_alerts: 20,
        }
    }
}

#[derive(Default)]
struct AlertState {
    response_time_violated: bool,
    success_rate_violated: bool,
    degrading: bool,
    recent: VecDeque<Alert>,
    counts: AlertCounts,
    baseline_p95: Option<f64>,
}

struct TrackerInner {
    samples: VecDeque<Sample>,
    alerts: AlertState,
}

/// Per-agent performance tracker
///
/// Recording is O(1) behind a plain mutex; dashboards sort a copy of the
/// window on demand.
pub struct PerformanceTracker {
    inner: Mutex<TrackerInner>,
    config: TrackerConfig,
    sla: SlaConfig,
}

impl PerformanceTracker {
    /// Creates a tracker with the given tuning and SLA
    pub fn new(config: TrackerConfig, sla: SlaConfig) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                samples: VecDeque::with_capacity(config.ring_capacity.as_usize()),
                alerts: AlertState::default(),
            }),
            config,
            sla,
        }
    }

    /// Records one operation outcome; O(1)
    pub fn record_operation(&self, duration_ms: f64, success: bool, capability: Option<&str>) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.samples.len() >= self.config.ring_capacity.as_usize() {
            inner.samples.pop_front();
        }
        inner.samples.push_back(Sample {
            at: Instant::now(),
            at_ms: chrono::Utc::now().timestamp_millis(),
            duration_ms,
            success,
            capability: capability.map(ToString::to_string),
        });
    }

    /// Number of retained samples (never exceeds the ring bound)
    pub fn sample_count(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").samples.len()
    }

    /// Aggregates over the current window
    pub fn current_metrics(&self) -> AggregatedMetrics {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let window = self.window(&inner.samples);
        Self::aggregate(&window)
    }

    /// SLA standing; evaluating also advances the edge-transition alert
    /// state
    pub fn check_sla_compliance(&self) -> SlaCompliance {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let window = self.window(&inner.samples);
        let metrics = Self::aggregate(&window);
        let compliance = self.compliance_for(&metrics);
        let trend = self.trend_for(&window);
        self.advance_alert_state(&mut inner.alerts, &metrics, &compliance, trend.trend);
        compliance
    }

    /// Trend verdict over the current window
    pub fn trend(&self) -> TrendAnalysis {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let window = self.window(&inner.samples);
        self.trend_for(&window)
    }

    /// Full dashboard: aggregates, trend, SLA, alerts, recommendations
    pub fn dashboard(&self) -> Dashboard {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let window = self.window(&inner.samples);
        let metrics = Self::aggregate(&window);
        let compliance = self.compliance_for(&metrics);
        let trend = self.trend_for(&window);
        self.advance_alert_state(&mut inner.alerts, &metrics, &compliance, trend.trend);

        let recommendations =
            Self::recommendations(&metrics, &compliance, trend.trend, &inner.alerts);

        Dashboard {
            performance_summary: PerformanceSummary {
                current: metrics,
                trend_analysis: trend,
            },
            sla: compliance,
            alerts: AlertSummary {
                recent: inner.alerts.recent.iter().cloned().collect(),
                counts: inner.alerts.counts.clone(),
            },
            recommendations,
        }
    }

    /// Most recent window: the last `window_samples` samples or everything
    /// within `window_duration`, whichever yields more data
    fn window(&self, samples: &VecDeque<Sample>) -> Vec<Sample> {
        let now = Instant::now();
        let in_time = samples
            .iter()
            .filter(|s| now.duration_since(s.at) <= self.config.window_duration)
            .count();
        let take = in_time.max(self.config.window_samples.min(samples.len()));
        samples.iter().skip(samples.len() - take).cloned().collect()
    }

    fn aggregate(window: &[Sample]) -> AggregatedMetrics {
        if window.is_empty() {
            return AggregatedMetrics::empty();
        }

        let mut durations: Vec<f64> = window.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let successes = window.iter().filter(|s| s.success).count();
        let avg = durations.iter().sum::<f64>() / durations.len() as f64;

        let span_ms = window
            .last()
            .map(|last| last.at_ms - window[0].at_ms)
            .unwrap_or(0)
            .max(0) as f64;
        let throughput = if span_ms > 0.0 {
            window.len() as f64 / (span_ms / 60_000.0)
        } else {
            0.0
        };

        let mut by_capability = std::collections::BTreeMap::new();
        for sample in window {
            if let Some(capability) = &sample.capability {
                *by_capability.entry(capability.clone()).or_insert(0) += 1;
            }
        }

        AggregatedMetrics {
            sample_count: window.len(),
            success_rate_percent: successes as f64 / window.len() as f64 * 100.0,
            avg_ms: avg,
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            throughput_ops_per_min: throughput,
            by_capability,
        }
    }

    fn compliance_for(&self, metrics: &AggregatedMetrics) -> SlaCompliance {
        let response_compliant =
            metrics.sample_count == 0 || metrics.avg_ms <= self.sla.response_time_sla_ms;
        let success_compliant = metrics.sample_count == 0
            || metrics.success_rate_percent >= self.sla.min_success_rate_percent;
        SlaCompliance {
            response_time_sla: MetricCompliance {
                current: metrics.avg_ms,
                threshold: self.sla.response_time_sla_ms,
                compliant: response_compliant,
            },
            success_rate_sla: MetricCompliance {
                current: metrics.success_rate_percent,
                threshold: self.sla.min_success_rate_percent,
                compliant: success_compliant,
            },
            overall_compliant: response_compliant && success_compliant,
        }
    }

    fn trend_for(&self, window: &[Sample]) -> TrendAnalysis {
        let minimum = self.config.window_samples * 2 / 3;
        if window.len() < minimum || window.len() < 2 {
            return TrendAnalysis {
                trend: Trend::InsufficientData,
                earlier_half_avg_ms: 0.0,
                later_half_avg_ms: 0.0,
            };
        }

        let mid = window.len() / 2;
        let earlier: f64 =
            window[..mid].iter().map(|s| s.duration_ms).sum::<f64>() / mid as f64;
        let later: f64 = window[mid..].iter().map(|s| s.duration_ms).sum::<f64>()
            / (window.len() - mid) as f64;

        let threshold = self.config.degradation_threshold_percent / 100.0;
        let trend = if earlier > 0.0 && later > earlier * (1.0 + threshold) {
            Trend::Degrading
        } else if earlier > 0.0 && later < earlier * (1.0 - threshold) {
            Trend::Improving
        } else {
            Trend::Stable
        };

        TrendAnalysis {
            trend,
            earlier_half_avg_ms: earlier,
            later_half_avg_ms: later,
        }
    }

    fn advance_alert_state(
        &self,
        state: &mut AlertState,
        metrics: &AggregatedMetrics,
        compliance: &SlaCompliance,
        trend: Trend,
    ) {
        if metrics.sample_count == 0 {
            return;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Seed the p95 baseline at the first evaluation with data; later
        // degradation is judged against it.
        if state.baseline_p95.is_none() {
            state.baseline_p95 = Some(metrics.p95_ms);
        }

        let was_violated = state.response_time_violated || state.success_rate_violated;

        if !compliance.response_time_sla.compliant && !state.response_time_violated {
            Self::push_alert(
                state,
                self.config.max_recent_alerts,
                AlertKind::SlaViolation,
                format!(
                    "response time {:.0}ms exceeds SLA {:.0}ms",
                    compliance.response_time_sla.current, compliance.response_time_sla.threshold
                ),
                now_ms,
            );
        }
        state.response_time_violated = !compliance.response_time_sla.compliant;

        if !compliance.success_rate_sla.compliant && !state.success_rate_violated {
            Self::push_alert(
                state,
                self.config.max_recent_alerts,
                AlertKind::SlaViolation,
                format!(
                    "success rate {:.1}% below SLA {:.1}%",
                    compliance.success_rate_sla.current, compliance.success_rate_sla.threshold
                ),
                now_ms,
            );
        }
        state.success_rate_violated = !compliance.success_rate_sla.compliant;

        if was_violated && compliance.overall_compliant {
            Self::push_alert(
                state,
                self.config.max_recent_alerts,
                AlertKind::Recovery,
                "all SLA metrics back within thresholds".to_string(),
                now_ms,
            );
        }

        let p95_elevated = state
            .baseline_p95
            .is_some_and(|baseline| metrics.p95_ms > baseline * self.config.degradation_p95_factor);
        let degrading_now = trend == Trend::Degrading && p95_elevated;
        if degrading_now && !state.degrading {
            Self::push_alert(
                state,
                self.config.max_recent_alerts,
                AlertKind::PerformanceDegradation,
                format!(
                    "latency trending up; p95 {:.0}ms exceeds baseline by more than {:.0}%",
                    metrics.p95_ms,
                    (self.config.degradation_p95_factor - 1.0) * 100.0
                ),
                now_ms,
            );
        }
        state.degrading = degrading_now;
    }

    fn push_alert(
        state: &mut AlertState,
        max_recent: usize,
        kind: AlertKind,
        message: String,
        at_ms: i64,
    ) {
        match kind {
            AlertKind::SlaViolation => state.counts.sla_violation += 1,
            AlertKind::PerformanceDegradation => state.counts.performance_degradation += 1,
            AlertKind::Recovery => state.counts.recovery += 1,
        }
        if state.recent.len() >= max_recent {
            state.recent.pop_front();
        }
        state.recent.push_back(Alert { kind, message, at_ms });
    }

    fn recommendations(
        metrics: &AggregatedMetrics,
        compliance: &SlaCompliance,
        trend: Trend,
        state: &AlertState,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if trend == Trend::Degrading
            && state
                .baseline_p95
                .is_some_and(|baseline| metrics.p95_ms > baseline * 1.5)
        {
            out.push("investigate upstream latency: p95 is well above its baseline".to_string());
        }
        if !compliance.response_time_sla.compliant {
            out.push(
                "warm the semantic cache for frequent query patterns to cut response time"
                    .to_string(),
            );
        }
        if !compliance.success_rate_sla.compliant {
            out.push("review recent failures: success rate is below its SLA floor".to_string());
        }
        out
    }
}

/// Exact percentile over an already-sorted slice
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
