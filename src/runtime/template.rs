//! Data model: agent templates, agent state, and runs.
//!
//! Grounded on `crewai::agent::core::Agent` (the shape of a long-lived
//! agent record) and `crewai::agents::crew_agent_executor::CrewAgentExecutor`
//! (the shape of one execution's working state), generalized from a
//! single concrete "Agent" into the template/instance split this runtime
//! needs for recursive spawning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent_loop::StepHandler;

/// Opaque non-negative cost unit. The runtime sums these but never
/// interprets them.
pub type Credit = f64;

/// Agent type identifiers that may spawn any child template without an
/// explicit `spawnableAgents` entry.
pub const BASE_AGENT_IDS: &[&str] = &["base", "base-lite", "base-max", "base-experimental"];

/// A fully-qualified agent template reference: `publisher/id@version`,
/// with `publisher` and `version` optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentTemplateRef {
    pub publisher: Option<String>,
    pub id: String,
    pub version: Option<String>,
}

impl AgentTemplateRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            publisher: None,
            id: id.into(),
            version: None,
        }
    }

    /// Compatible-id match used for `spawnableAgents` permission checks:
    /// equal on `id`; `publisher`/`version` match iff equal, or iff the
    /// *child* side leaves them unset (wildcard from the child's
    /// perspective — a parent's declared entry is always concrete).
    pub fn compatible_with(&self, allowed: &AgentTemplateRef) -> bool {
        if self.id != allowed.id {
            return false;
        }
        fn field_ok(child: &Option<String>, allowed: &Option<String>) -> bool {
            match child {
                None => true,
                Some(c) => allowed.as_deref() == Some(c.as_str()),
            }
        }
        field_ok(&self.publisher, &allowed.publisher) && field_ok(&self.version, &allowed.version)
    }
}

/// Declarative description of an agent "type". Immutable within a run.
pub struct AgentTemplate {
    pub reference: AgentTemplateRef,
    pub model: String,
    pub system_prompt_fragments: Vec<String>,
    pub instructions_prompt_fragment: Option<String>,
    pub tool_names: Vec<String>,
    pub spawnable_agents: Vec<AgentTemplateRef>,
    pub input_prompt_schema: Option<Value>,
    pub input_params_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub inherit_parent_system_prompt: bool,
    pub include_message_history: bool,
    /// Constructs a fresh, independent step-handler coroutine for one run
    /// of this template. `None` for templates with no programmatic
    /// behavior (pure LLM-turn loop).
    pub step_handler_factory: Option<Box<dyn Fn() -> Box<dyn StepHandler> + Send + Sync>>,
}

impl AgentTemplate {
    pub fn is_base_agent(&self) -> bool {
        BASE_AGENT_IDS.contains(&self.reference.id.as_str())
    }

    /// Whether `child` is reachable from this template under the
    /// base-agent-spawns-anything / compatible-id rules.
    pub fn may_spawn(&self, child: &AgentTemplateRef) -> bool {
        if self.is_base_agent() {
            return true;
        }
        self.spawnable_agents
            .iter()
            .any(|allowed| child.compatible_with(allowed))
    }
}

/// Small persistent scratch record a programmatic step handler may attach
/// to an agent's context under a string key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Subgoal {
    pub description: String,
    pub data: HashMap<String, Value>,
}

/// Output a `set_output`-bearing run resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    Value(Value),
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },
}

/// Per-instance state for one live agent. Owned by the `AgentLoop` driving
/// it; children get their own fresh `AgentState`.
pub struct AgentState {
    pub agent_id: Uuid,
    pub agent_type: AgentTemplateRef,
    pub run_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub ancestor_run_ids: Vec<Uuid>,

    pub message_history: super::message::MessageStore,

    pub steps_remaining: u32,
    pub credits_used: Credit,
    pub direct_credits_used: Credit,
    pub child_run_ids: Vec<Uuid>,

    pub output: Option<AgentOutput>,
    pub has_retried_output_schema: bool,

    pub agent_context: HashMap<String, Subgoal>,
    pub context_token_count: u64,
}

impl AgentState {
    pub fn new(agent_type: AgentTemplateRef, steps_remaining: u32) -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            agent_type,
            run_id: None,
            parent_id: None,
            ancestor_run_ids: Vec::new(),
            message_history: super::message::MessageStore::new(),
            steps_remaining,
            credits_used: 0.0,
            direct_credits_used: 0.0,
            child_run_ids: Vec::new(),
            output: None,
            has_retried_output_schema: false,
            agent_context: HashMap::new(),
            context_token_count: 0,
        }
    }

    /// Roll a child's total cost into this agent's `credits_used` (but not
    /// `direct_credits_used` — that only ever reflects this agent's own
    /// calls). Maintains the invariant
    /// `root.credits_used == root.direct_credits_used + sum(child.credits_used)`.
    pub fn absorb_child_cost(&mut self, child_total_credits: Credit) {
        self.credits_used += child_total_credits;
    }

    pub fn add_direct_cost(&mut self, credits: Credit) {
        self.direct_credits_used += credits;
        self.credits_used += credits;
    }
}

/// Status of a top-level (or nested, but tracked independently) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Aggregate record of one agent invocation, as reported to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub agent_id: Uuid,
    pub status: RunStatus,
    pub total_steps: u32,
    pub direct_credits: Credit,
    pub total_credits: Credit,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_agent_spawns_anything() {
        let template = AgentTemplate {
            reference: AgentTemplateRef::new("base"),
            model: "gpt-5".into(),
            system_prompt_fragments: vec![],
            instructions_prompt_fragment: None,
            tool_names: vec![],
            spawnable_agents: vec![],
            input_prompt_schema: None,
            input_params_schema: None,
            output_schema: None,
            inherit_parent_system_prompt: false,
            include_message_history: false,
            step_handler_factory: None,
        };
        assert!(template.may_spawn(&AgentTemplateRef::new("anything")));
    }

    #[test]
    fn non_base_agent_requires_explicit_permission() {
        let template = AgentTemplate {
            reference: AgentTemplateRef::new("researcher"),
            model: "gpt-5".into(),
            system_prompt_fragments: vec![],
            instructions_prompt_fragment: None,
            tool_names: vec![],
            spawnable_agents: vec![AgentTemplateRef::new("summarizer")],
            input_prompt_schema: None,
            input_params_schema: None,
            output_schema: None,
            inherit_parent_system_prompt: false,
            include_message_history: false,
            step_handler_factory: None,
        };
        assert!(template.may_spawn(&AgentTemplateRef::new("summarizer")));
        assert!(!template.may_spawn(&AgentTemplateRef::new("other")));
    }

    #[test]
    fn compatible_id_wildcards_absent_fields() {
        let mut child = AgentTemplateRef::new("summarizer");
        child.publisher = None; // child omits publisher => wildcard
        let allowed = AgentTemplateRef {
            publisher: Some("acme".into()),
            id: "summarizer".into(),
            version: None,
        };
        assert!(child.compatible_with(&allowed));
    }

    #[test]
    fn credit_rollup_invariant_holds() {
        let mut root = AgentState::new(AgentTemplateRef::new("base"), 10);
        root.add_direct_cost(1.5);
        root.absorb_child_cost(3.0);
        root.absorb_child_cost(0.5);
        assert_eq!(root.credits_used, root.direct_credits_used + 3.5);
    }
}
