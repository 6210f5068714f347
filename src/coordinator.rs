//! Coordinator: the fixed orchestration pipeline
//!
//! Every request flows through four nodes in order: router (intent
//! classification), planner (intent to ordered capability calls), executor
//! (dispatch through the registry), and reviewer (summary). Step failures
//! are collected without halting unless the step is required. A small
//! policy engine gates execution; deny is terminal and approval
//! requirements surface to the caller.

use crate::domain_types::CapabilityVerb;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::RegistryClient;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline for one executor capability call
const STEP_DEADLINE: Duration = Duration::from_secs(10);

/// Pipeline node names, in execution order
pub const PIPELINE_NODES: [&str; 4] = ["router", "planner", "executor", "reviewer"];

/// One recorded step failure
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    /// The failing step name
    pub step: String,
    /// Error taxonomy kind
    pub kind: ErrorKind,
    /// Human-readable reason
    pub message: String,
}

/// State threaded through the pipeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineState {
    /// Accumulated context: `intent`, `plan`, `summary`
    pub context: Map<String, Value>,
    /// Nodes traversed, in order
    pub execution_path: Vec<String>,
    /// Step results keyed by step name
    pub results: Map<String, Value>,
    /// Collected step failures
    pub errors: Vec<StepError>,
}

/// One planned capability call or local processing step
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    /// Step name (the verb for capability steps)
    pub name: String,
    /// Capability to dispatch; local steps carry none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityVerb>,
    /// Parameters passed to the capability
    pub parameters: Value,
    /// Whether failure aborts the pipeline
    pub required: bool,
}

impl PlannedStep {
    fn capability_call(verb: &str, parameters: Value) -> Self {
        Self {
            name: verb.to_string(),
            capability: CapabilityVerb::try_new(verb.to_string()).ok(),
            parameters,
            required: false,
        }
    }

    fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: None,
            parameters: json!({}),
            required: false,
        }
    }
}

/// Rule verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    RequireApproval,
}

/// One policy rule
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRule {
    /// Rule identifier
    pub id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Verdict when the rule matches
    pub action: PolicyAction,
    /// Exact-match conditions over the evaluation context
    pub conditions: BTreeMap<String, String>,
    /// Higher wins; ties resolve to the earliest-added rule
    pub priority: i64,
    /// Disabled rules never match
    pub enabled: bool,
    seq: u64,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    /// The verdict
    pub action: PolicyAction,
    /// Name of the matched rule, if any
    pub matched_rule: Option<String>,
}

/// Hot-editable rule list with priority evaluation
#[derive(Default)]
pub struct PolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
    next_seq: AtomicU64,
}

impl PolicyEngine {
    /// Creates an empty engine (default verdict: allow)
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule and returns its id
    pub fn add_rule(
        &self,
        name: impl Into<String>,
        action: PolicyAction,
        conditions: BTreeMap<String, String>,
        priority: i64,
    ) -> Uuid {
        let rule = PolicyRule {
            id: Uuid::new_v4(),
            name: name.into(),
            action,
            conditions,
            priority,
            enabled: true,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let id = rule.id;
        self.rules.write().expect("policy lock poisoned").push(rule);
        id
    }

    /// Removes a rule; false when unknown
    pub fn remove_rule(&self, id: Uuid) -> bool {
        let mut rules = self.rules.write().expect("policy lock poisoned");
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        rules.len() != before
    }

    /// Enables a rule; false when unknown
    pub fn enable_rule(&self, id: Uuid) -> bool {
        self.set_enabled(id, true)
    }

    /// Disables a rule; false when unknown
    pub fn disable_rule(&self, id: Uuid) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut rules = self.rules.write().expect("policy lock poisoned");
        match rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All rules, highest priority first
    pub fn rules(&self) -> Vec<PolicyRule> {
        let mut rules = self.rules.read().expect("policy lock poisoned").clone();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        rules
    }

    /// Evaluates the context against the rule list
    ///
    /// The highest-priority enabled rule whose conditions all match wins;
    /// equal priorities resolve to the earliest-added rule. No match means
    /// allow.
    pub fn evaluate(&self, context: &BTreeMap<String, String>) -> PolicyDecision {
        let rules = self.rules.read().expect("policy lock poisoned");
        let mut best: Option<&PolicyRule> = None;
        for rule in rules.iter().filter(|rule| rule.enabled) {
            let matches = rule
                .conditions
                .iter()
                .all(|(key, expected)| context.get(key) == Some(expected));
            if !matches {
                continue;
            }
            best = match best {
                None => Some(rule),
                Some(current)
                    if rule.priority > current.priority
                        || (rule.priority == current.priority && rule.seq < current.seq) =>
                {
                    Some(rule)
                }
                Some(current) => Some(current),
            };
        }
        match best {
            Some(rule) => PolicyDecision {
                action: rule.action,
                matched_rule: Some(rule.name.clone()),
            },
            None => PolicyDecision {
                action: PolicyAction::Allow,
                matched_rule: None,
            },
        }
    }
}

/// Classifies the user input into a coarse intent label
pub fn classify_intent(input: &str) -> &'static str {
    let lowered = input.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    if has(&["email", "mail", "inbox"]) {
        "mail_operation"
    } else if has(&["calendar", "meeting", "schedule", "event", "appointment"]) {
        "calendar_operation"
    } else if has(&["contact", "phone number", "address book"]) {
        "contacts_operation"
    } else if has(&["remember", "recall", "memory", "note"]) {
        "memory_operation"
    } else {
        "general_query"
    }
}

/// Expands an intent into an ordered plan
pub fn plan_for_intent(intent: &str, input: &str) -> Vec<PlannedStep> {
    match intent {
        "mail_operation" => vec![
            PlannedStep::capability_call("mail.search", json!({ "query": input })),
            PlannedStep::local("process_results"),
        ],
        "calendar_operation" => vec![
            PlannedStep::capability_call("calendar.read", json!({ "query": input })),
            PlannedStep::local("propose_event"),
        ],
        "contacts_operation" => vec![PlannedStep::capability_call(
            "contacts.resolve",
            json!({ "query": input }),
        )],
        "memory_operation" => vec![PlannedStep::capability_call(
            "memory.retrieve",
            json!({ "query": input }),
        )],
        _ => vec![PlannedStep::local("general_processing")],
    }
}

/// The coordinator service
///
/// Without a registry client the executor runs in planning-only mode:
/// capability steps complete as `planned` rather than being dispatched.
pub struct Coordinator {
    registry: Option<Arc<RegistryClient>>,
    policy: Arc<PolicyEngine>,
}

impl Coordinator {
    /// Creates a coordinator dispatching through `registry`
    pub fn new(registry: Option<Arc<RegistryClient>>, policy: Arc<PolicyEngine>) -> Self {
        Self { registry, policy }
    }

    /// The policy engine, for hot rule edits
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Runs the full pipeline over one user input
    ///
    /// # Errors
    /// Returns `forbidden` on policy denial and the failing step's kind
    /// when a required step fails; collected optional-step failures live in
    /// `state.errors` instead.
    pub async fn process_request(&self, input: &str) -> Result<PipelineState> {
        if input.trim().is_empty() {
            return Err(Error::bad_request("input must not be empty"));
        }

        let mut state = PipelineState::default();

        // Router.
        let intent = classify_intent(input);
        state.context.insert("intent".to_string(), json!(intent));
        state.execution_path.push("router".to_string());
        debug!(intent, "routed request");

        // Planner.
        let plan = plan_for_intent(intent, input);
        state.context.insert(
            "plan".to_string(),
            json!(plan.iter().map(|s| s.name.clone()).collect::<Vec<_>>()),
        );
        state.execution_path.push("planner".to_string());

        // Policy gate covers the whole plan before anything executes.
        for step in plan.iter().filter(|s| s.capability.is_some()) {
            let mut policy_context = BTreeMap::new();
            policy_context.insert("operation".to_string(), step.name.clone());
            let decision = self.policy.evaluate(&policy_context);
            match decision.action {
                PolicyAction::Allow => {}
                PolicyAction::Deny => {
                    warn!(step = %step.name, rule = ?decision.matched_rule, "policy denied");
                    return Err(Error::forbidden(format!(
                        "policy denied operation {}",
                        step.name
                    )));
                }
                PolicyAction::RequireApproval => {
                    state
                        .context
                        .insert("approval_required".to_string(), json!(step.name));
                    state.execution_path.push("executor".to_string());
                    state.execution_path.push("reviewer".to_string());
                    return Ok(state);
                }
            }
        }

        // Executor: planned steps run in declared order, never in parallel.
        state.execution_path.push("executor".to_string());
        for step in &plan {
            match self.execute_step(step).await {
                Ok(result) => {
                    state.results.insert(step.name.clone(), result);
                }
                Err(err) => {
                    let step_error = StepError {
                        step: step.name.clone(),
                        kind: err.kind(),
                        message: err.message().to_string(),
                    };
                    if step.required {
                        return Err(err);
                    }
                    state.errors.push(step_error);
                }
            }
        }

        // Reviewer.
        state.context.insert(
            "summary".to_string(),
            json!({
                "intent": intent,
                "steps_completed": state.results.len(),
                "steps_failed": state.errors.len(),
            }),
        );
        state.execution_path.push("reviewer".to_string());

        info!(
            intent,
            completed = state.results.len(),
            failed = state.errors.len(),
            "pipeline finished"
        );
        Ok(state)
    }

    async fn execute_step(&self, step: &PlannedStep) -> Result<Value> {
        let Some(verb) = &step.capability else {
            return Ok(json!({ "status": "completed", "step": step.name }));
        };

        let Some(registry) = &self.registry else {
            // Planning-only mode: nothing to dispatch to.
            return Ok(json!({ "status": "planned", "capability": verb }));
        };

        let agents = registry.agents_for_capability(verb).await?;
        let Some(agent) = agents.first() else {
            return Err(Error::not_found(format!(
                "no live agent advertises {verb}"
            )));
        };

        let output = agent
            .call(verb, step.parameters.clone(), STEP_DEADLINE)
            .await?;
        Ok(json!({
            "status": "completed",
            "agent_id": agent.manifest().agent_id,
            "output": output,
        }))
    }
}
