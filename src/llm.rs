//! Natural-language query interpretation against a local model endpoint
//!
//! The interpreter translates a user query plus agent context into a
//! structured `{capability, parameters, confidence, reasoning}` verdict. It
//! never raises: timeouts, transport failures, and unparseable model output
//! all come back as zero-confidence verdicts so callers can decide.
//!
//! The endpoint speaks the local generation protocol: `POST /api/generate`
//! with `{model, prompt, stream, options}`, newline-delimited JSON when
//! streaming, and `GET /api/tags` to enumerate installed models.

use crate::domain_types::{CapabilityVerb, Confidence, TimeoutMs};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Sentinel capability for model output that could not be parsed
pub const UNPARSEABLE_CAPABILITY: &str = "__unparseable__";

/// Ceiling applied when the model names a capability the agent does not
/// advertise
const UNSUPPORTED_CONFIDENCE_CEILING: f64 = 0.3;

/// A capability summary fed into the dispatch prompt
#[derive(Debug, Clone)]
pub struct CapabilitySummary {
    /// The verb, e.g. `mail.search`
    pub verb: CapabilityVerb,
    /// One-line description shown to the model
    pub description: String,
}

/// Structured interpreter verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    /// Chosen capability verb, or the unparseable sentinel
    pub capability: String,
    /// Parameters for the capability handler
    pub parameters: Value,
    /// Self-reported trust in the plan
    pub confidence: Confidence,
    /// Model-provided reasoning, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// True when the named capability is outside the advertised set
    #[serde(default)]
    pub unsupported: bool,
    /// Failure reason when the verdict is a zero-confidence sentinel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Interpretation {
    /// Zero-confidence verdict carrying a failure reason
    pub fn failed(capability: &str, reason: impl Into<String>) -> Self {
        Self {
            capability: capability.to_string(),
            parameters: json!({}),
            confidence: Confidence::zero(),
            reasoning: None,
            unsupported: false,
            error: Some(reason.into()),
        }
    }
}

/// The interpretation seam: agents depend on this trait, not on the
/// transport, so tests can script verdicts
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Interprets `query` in the context of one agent's capability set
    async fn interpret(
        &self,
        query: &str,
        agent_context: &str,
        capabilities: &[CapabilitySummary],
    ) -> Interpretation;
}

/// Stateful `<think>…</think>` scrubber, safe across stream chunk
/// boundaries: a tag split over two chunks never leaks
#[derive(Debug, Default)]
pub struct ThinkFilter {
    in_think: bool,
    carry: String,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkFilter {
    /// Creates a filter in pass-through state
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the user-visible portion
    pub fn push(&mut self, chunk: &str) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.in_think {
                match data.find(THINK_CLOSE) {
                    Some(idx) => {
                        data.drain(..idx + THINK_CLOSE.len());
                        self.in_think = false;
                    }
                    None => {
                        // Scratchpad content is discarded; keep only what
                        // could be the start of the closing tag.
                        self.carry = trailing_tag_prefix(&data, THINK_CLOSE);
                        return out;
                    }
                }
            } else {
                match data.find(THINK_OPEN) {
                    Some(idx) => {
                        out.push_str(&data[..idx]);
                        data.drain(..idx + THINK_OPEN.len());
                        self.in_think = true;
                    }
                    None => {
                        let keep = trailing_tag_prefix(&data, THINK_OPEN).len();
                        out.push_str(&data[..data.len() - keep]);
                        self.carry = data[data.len() - keep..].to_string();
                        return out;
                    }
                }
            }
        }
    }

    /// Flushes any held-back text at end of stream
    pub fn finish(&mut self) -> String {
        if self.in_think {
            // Unterminated scratchpad: drop it.
            self.carry.clear();
            String::new()
        } else {
            std::mem::take(&mut self.carry)
        }
    }
}

/// Longest proper prefix of `tag` that is a suffix of `data`
fn trailing_tag_prefix(data: &str, tag: &str) -> String {
    for len in (1..tag.len()).rev() {
        if data.ends_with(&tag[..len]) {
            return tag[..len].to_string();
        }
    }
    String::new()
}

/// Removes every `<think>…</think>` block from a complete response
pub fn strip_think_blocks(text: &str) -> String {
    let mut filter = ThinkFilter::new();
    let mut out = filter.push(text);
    out.push_str(&filter.finish());
    out.trim().to_string()
}

/// Builds the dispatch prompt from the agent context, capability summaries,
/// and the user query
pub fn build_dispatch_prompt(
    query: &str,
    agent_context: &str,
    capabilities: &[CapabilitySummary],
) -> String {
    let mut capability_lines = String::new();
    for cap in capabilities {
        capability_lines.push_str(&format!("- {}: {}\n", cap.verb, cap.description));
    }

    format!(
        "You dispatch natural-language requests to one capability of a local \
         assistant agent.\n\n\
         Agent: {agent_context}\n\n\
         Capabilities:\n{capability_lines}\n\
         User query: {query}\n\n\
         Respond with a single JSON object and nothing else:\n\
         {{\"capability\": \"<verb>\", \"parameters\": {{...}}, \
         \"confidence\": <0.0-1.0>, \"reasoning\": \"<one sentence>\"}}"
    )
}

/// Parses and sanitizes raw model output into an interpretation
///
/// Unparseable output yields the `__unparseable__` sentinel with zero
/// confidence; a capability outside `advertised` survives with its
/// confidence clamped low and the `unsupported` flag set.
pub fn parse_interpretation(raw: &str, advertised: &[CapabilityVerb]) -> Interpretation {
    let cleaned = strip_think_blocks(raw);
    let cleaned = cleaned
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let parsed: Option<Value> = serde_json::from_str(cleaned).ok().or_else(|| {
        // Models sometimes wrap the object in prose; retry on the outermost
        // braces.
        let start = cleaned.find('{')?;
        let end = cleaned.rfind('}')?;
        serde_json::from_str(&cleaned[start..=end]).ok()
    });

    let Some(parsed) = parsed else {
        return Interpretation::failed(UNPARSEABLE_CAPABILITY, "model output was not valid JSON");
    };

    let capability = parsed
        .get("capability")
        .and_then(Value::as_str)
        .unwrap_or(UNPARSEABLE_CAPABILITY)
        .to_string();
    let parameters = parsed.get("parameters").cloned().unwrap_or_else(|| json!({}));
    let raw_confidence = parsed
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let confidence =
        Confidence::try_new(raw_confidence).unwrap_or_else(|_| Confidence::zero());
    let reasoning = parsed
        .get("reasoning")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let supported = advertised.iter().any(|verb| verb.as_str() == capability);
    if supported {
        Interpretation {
            capability,
            parameters,
            confidence,
            reasoning,
            unsupported: false,
            error: None,
        }
    } else {
        Interpretation {
            capability,
            parameters,
            confidence: confidence.clamped_to(UNSUPPORTED_CONFIDENCE_CEILING),
            reasoning,
            unsupported: true,
            error: None,
        }
    }
}

/// Request body for the generation endpoint
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    stop: Vec<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 512,
            stop: Vec::new(),
        }
    }
}

/// One frame of a newline-delimited streaming response
#[derive(Debug, Deserialize)]
struct GenerateFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Client for a local generation endpoint (Ollama protocol)
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: TimeoutMs,
}

impl LlmClient {
    /// Creates a client for `model` at `base_url`
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: TimeoutMs) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    /// The configured model identifier
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Lists models installed on the endpoint (`GET /api/tags`)
    ///
    /// # Errors
    /// Returns an error when the endpoint is unreachable.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .timeout(self.timeout.as_duration())
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;
        let body: Value = response.json().await?;
        let names = body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    /// Checks whether the configured model is installed
    ///
    /// Unreachable endpoints report `false` rather than erroring: the agent
    /// still starts, with interpretation degraded to fallbacks.
    pub async fn model_available(&self) -> bool {
        match self.list_models().await {
            Ok(names) => {
                let available = names.iter().any(|name| name.contains(&self.model));
                if !available {
                    warn!(model = %self.model, "configured model not installed on endpoint");
                }
                available
            }
            Err(err) => {
                warn!(error = %err, "generation endpoint unreachable");
                false
            }
        }
    }

    /// Single-shot generation with the hard interpreter deadline
    ///
    /// # Errors
    /// Returns `upstream_timeout` on deadline, `upstream_unavailable` on
    /// transport failure.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions::default(),
        };

        let send = async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()
                .map_err(Error::from)?;
            let value: Value = response.json().await?;
            Ok::<String, Error>(value["response"].as_str().unwrap_or_default().to_string())
        };

        match tokio::time::timeout(self.timeout.as_duration(), send).await {
            Ok(result) => result,
            Err(_) => Err(Error::upstream_timeout(format!(
                "generation exceeded {}ms",
                self.timeout.as_u64()
            ))),
        }
    }

    /// Streaming generation: yields user-visible tokens with scratchpad
    /// segments already scrubbed
    ///
    /// # Errors
    /// Returns an error when the request cannot be initiated; mid-stream
    /// failures end the stream.
    pub async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<impl Stream<Item = String> + Send> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: GenerateOptions::default(),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout.as_duration())
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?;

        let byte_stream = response.bytes_stream();
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), ThinkFilter::new(), false),
            |(mut bytes, mut line_buffer, mut filter, mut done)| async move {
                loop {
                    if done {
                        let tail = filter.finish();
                        if tail.is_empty() {
                            return None;
                        }
                        // Emit the flushed tail as the final item.
                        return Some((tail, (bytes, line_buffer, ThinkFilter::new(), true)));
                    }

                    // Drain complete NDJSON lines already buffered.
                    if let Some(newline) = line_buffer.find('\n') {
                        let line: String = line_buffer.drain(..=newline).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(frame) = serde_json::from_str::<GenerateFrame>(line) else {
                            continue;
                        };
                        if frame.done {
                            done = true;
                        }
                        let visible = filter.push(&frame.response);
                        if !visible.is_empty() {
                            return Some((visible, (bytes, line_buffer, filter, done)));
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            line_buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "stream transport error, ending stream");
                            done = true;
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(stream)
    }
}

/// Interpreter backed by the local generation endpoint
pub struct LlmInterpreter {
    client: LlmClient,
}

impl LlmInterpreter {
    /// Wraps a generation client
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &LlmClient {
        &self.client
    }
}

#[async_trait]
impl Interpreter for LlmInterpreter {
    async fn interpret(
        &self,
        query: &str,
        agent_context: &str,
        capabilities: &[CapabilitySummary],
    ) -> Interpretation {
        let prompt = build_dispatch_prompt(query, agent_context, capabilities);
        let advertised: Vec<CapabilityVerb> =
            capabilities.iter().map(|c| c.verb.clone()).collect();

        match self.client.generate(&prompt).await {
            Ok(raw) => parse_interpretation(&raw, &advertised),
            Err(err) => {
                debug!(error = %err, "interpreter call failed");
                Interpretation::failed(UNPARSEABLE_CAPABILITY, err.to_string())
            }
        }
    }
}

/// Interpreter that replays scripted verdicts
///
/// Queued verdicts are returned in order; once the queue drains, the
/// default verdict repeats. Used by tests and by demo wiring where no model
/// endpoint is running.
pub struct ScriptedInterpreter {
    queue: std::sync::Mutex<std::collections::VecDeque<Interpretation>>,
    default: Interpretation,
    calls: std::sync::atomic::AtomicUsize,
}

impl Default for ScriptedInterpreter {
    fn default() -> Self {
        Self {
            queue: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default: Interpretation::failed(UNPARSEABLE_CAPABILITY, "no scripted verdict"),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl ScriptedInterpreter {
    /// Repeats `verdict` on every call
    pub fn with_verdict(verdict: Interpretation) -> Self {
        Self {
            default: verdict,
            ..Self::default()
        }
    }

    /// Queues a verdict to be returned before the default
    pub fn push(&self, verdict: Interpretation) {
        self.queue.lock().expect("script lock poisoned").push_back(verdict);
    }

    /// Number of interpret calls observed
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn interpret(
        &self,
        _query: &str,
        _agent_context: &str,
        _capabilities: &[CapabilitySummary],
    ) -> Interpretation {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.queue
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verbs(names: &[&str]) -> Vec<CapabilityVerb> {
        names
            .iter()
            .map(|n| CapabilityVerb::try_new((*n).to_string()).unwrap())
            .collect()
    }

    #[test]
    fn strips_single_think_block() {
        let raw = "<think>planning the dispatch</think>{\"capability\": \"mail.search\"}";
        assert_eq!(strip_think_blocks(raw), "{\"capability\": \"mail.search\"}");
    }

    #[test]
    fn think_filter_handles_tag_split_across_chunks() {
        let mut filter = ThinkFilter::new();
        let mut out = String::new();
        out.push_str(&filter.push("before <thi"));
        out.push_str(&filter.push("nk>hidden</th"));
        out.push_str(&filter.push("ink> after"));
        out.push_str(&filter.finish());
        assert_eq!(out, "before  after");
    }

    #[test]
    fn think_filter_drops_unterminated_scratchpad() {
        let mut filter = ThinkFilter::new();
        let mut out = String::new();
        out.push_str(&filter.push("visible <think>never closed"));
        out.push_str(&filter.finish());
        assert_eq!(out, "visible ");
    }

    #[test]
    fn think_filter_passes_angle_brackets_that_are_not_tags() {
        let mut filter = ThinkFilter::new();
        let mut out = String::new();
        out.push_str(&filter.push("a < b and <thing>"));
        out.push_str(&filter.finish());
        assert_eq!(out, "a < b and <thing>");
    }

    #[test]
    fn parses_well_formed_interpretation() {
        let advertised = verbs(&["mail.search"]);
        let raw = r#"{"capability": "mail.search", "parameters": {"q": "project x"},
                      "confidence": 0.9, "reasoning": "search request"}"#;
        let interp = parse_interpretation(raw, &advertised);
        assert_eq!(interp.capability, "mail.search");
        assert_eq!(interp.parameters["q"], "project x");
        assert!((interp.confidence.value() - 0.9).abs() < 1e-9);
        assert!(!interp.unsupported);
    }

    #[test]
    fn non_json_output_yields_unparseable_sentinel() {
        let interp = parse_interpretation("I think you want to search mail.", &verbs(&["mail.search"]));
        assert_eq!(interp.capability, UNPARSEABLE_CAPABILITY);
        assert!((interp.confidence.value()).abs() < f64::EPSILON);
        assert!(interp.error.is_some());
    }

    #[test]
    fn json_inside_prose_is_recovered() {
        let raw = "Here is the dispatch: {\"capability\": \"mail.search\", \"confidence\": 0.8}";
        let interp = parse_interpretation(raw, &verbs(&["mail.search"]));
        assert_eq!(interp.capability, "mail.search");
    }

    #[test]
    fn unsupported_capability_is_clamped_not_rejected() {
        let raw = r#"{"capability": "mail.teleport", "parameters": {}, "confidence": 0.95}"#;
        let interp = parse_interpretation(raw, &verbs(&["mail.search"]));
        assert_eq!(interp.capability, "mail.teleport");
        assert!(interp.unsupported);
        assert!((interp.confidence.value() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn unsupported_low_confidence_is_not_raised() {
        let raw = r#"{"capability": "mail.teleport", "confidence": 0.1}"#;
        let interp = parse_interpretation(raw, &verbs(&["mail.search"]));
        assert!((interp.confidence.value() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn confidence_outside_range_is_clamped() {
        let raw = r#"{"capability": "mail.search", "confidence": 3.2}"#;
        let interp = parse_interpretation(raw, &verbs(&["mail.search"]));
        assert!((interp.confidence.value() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn markdown_fences_are_stripped() {
        let raw = "```json\n{\"capability\": \"mail.search\", \"confidence\": 0.7}\n```";
        let interp = parse_interpretation(raw, &verbs(&["mail.search"]));
        assert_eq!(interp.capability, "mail.search");
    }

    #[test]
    fn prompt_enumerates_capabilities() {
        let caps = vec![CapabilitySummary {
            verb: CapabilityVerb::try_new("mail.search".to_string()).unwrap(),
            description: "Search cached mail".to_string(),
        }];
        let prompt = build_dispatch_prompt("find invoices", "Mail agent", &caps);
        assert!(prompt.contains("mail.search: Search cached mail"));
        assert!(prompt.contains("find invoices"));
        assert!(prompt.contains("single JSON object"));
    }
}
