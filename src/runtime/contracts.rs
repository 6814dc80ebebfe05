//! External interfaces the agent loop calls through.
//!
//! These are the "out of scope, specified only by interface" collaborators:
//! LLM transport, run-lifecycle storage, analytics, the response sink
//! (see [`super::sink`]), the agent template registry, and project/file
//! context. Grounded on `crewai::llms::base_llm::BaseLLM` (async-trait
//! completion contract) and `crewai::events::event_bus` (the
//! track/analytics call shape).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::errors::RuntimeError;
use super::message::Message;
use super::stream::RawStreamReceiver;
use super::template::{AgentTemplate, Credit, RunStatus};

/// Token-count result; mirrors the teacher's pattern of a best-effort
/// provider call that may itself fail independently of the main request.
pub struct TokenCountResult {
    pub input_tokens: Option<u64>,
    pub error: Option<String>,
}

/// The LLM transport contract. Implemented by the host; the runtime never
/// speaks a wire protocol itself.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Start a streamed completion. `on_cost` is invoked once the
    /// provider reports usage for this call (may be before or after the
    /// stream completes, depending on the provider).
    async fn prompt_stream(
        &self,
        messages: &[Message],
        model: &str,
        tools: &Value,
        on_cost: &dyn Fn(Credit),
    ) -> Result<Box<dyn RawStreamReceiver>, RuntimeError>;

    /// Single-shot completion. When `n > 1`, the returned string must be
    /// a JSON array of `n` strings.
    async fn prompt(
        &self,
        messages: &[Message],
        model: &str,
        n: u32,
        on_cost: &dyn Fn(Credit),
    ) -> Result<String, RuntimeError>;

    async fn count_tokens(&self, messages: &[Message], system: &str) -> TokenCountResult;
}

/// Run-lifecycle storage contract.
#[async_trait]
pub trait RunStorage: Send + Sync {
    async fn start_agent_run(
        &self,
        agent_id: Uuid,
        ancestor_run_ids: &[Uuid],
    ) -> Result<Uuid, RuntimeError>;

    async fn add_agent_step(&self, step: AgentStepRecord) -> Result<(), RuntimeError>;

    async fn finish_agent_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        total_steps: u32,
        direct_credits: Credit,
        total_credits: Credit,
        error_message: Option<String>,
    ) -> Result<(), RuntimeError>;
}

pub struct AgentStepRecord {
    pub agent_run_id: Uuid,
    pub step_number: u32,
    pub credits: Credit,
    pub child_run_ids: Vec<Uuid>,
    pub message_id: Option<String>,
    pub status: StepRecordStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRecordStatus {
    Completed,
    Skipped,
}

/// Analytics/event tracking contract.
pub trait Analytics: Send + Sync {
    fn track_event(&self, event: &str, properties: &HashMap<String, Value>);
}

/// Looks up agent templates not already known locally.
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    async fn get_agent_template(&self, agent_id: &str) -> Option<AgentTemplate>;
}

/// File tree / custom tool / knowledge-file context injected for prompt
/// templating and tool dispatch. The runtime never touches the
/// filesystem directly.
pub trait ProjectFileContext: Send + Sync {
    fn file_tree(&self) -> Vec<String>;
    fn knowledge_file(&self, name: &str) -> Option<String>;
}
