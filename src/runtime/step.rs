//! Step Executor: one LLM turn.
//!
//! Grounded on `crewai::agents::crew_agent_executor::CrewAgentExecutor`,
//! whose `invoke_loop`/`invoke_loop_react` stubs mark exactly this turn
//! boundary (build prompt, call the LLM, decide whether to keep going).
//! This module replaces those stubs with the spec's force-end / n-response
//! / stream / end-turn-decision sequence.

use std::sync::Arc;

use serde_json::Value;

use super::config::RuntimeConfig;
use super::contracts::LlmTransport;
use super::dispatcher::ToolDispatcher;
use super::errors::RuntimeError;
use super::message::{ExpireBoundary, Message, MessageTtl, Role};
use super::sink::{emit_safely, ResponseEvent, ResponseSink};
use super::stream::StreamProcessor;
use super::template::{AgentState, Credit};

/// Tool names whose invocation alone does not force the turn to continue.
/// A turn with no tool activity outside this set, and no tool error, ends
/// via the "no work left to do" shortcut.
pub const TOOLS_WHICH_WONT_FORCE_NEXT_STEP: &[&str] = &["think", "read_file", "list_files"];

const STEP_WARNING_MESSAGE: &str =
    "Step budget exhausted: this agent has run out of steps and the turn is being force-ended.";

pub struct StepOutcome {
    pub end_turn: bool,
    /// Present only when the caller requested `n > 1` alternative
    /// completions for this turn; the agent loop decides which to keep.
    pub n_responses: Option<Vec<String>>,
}

pub struct StepExecutor<'a> {
    pub transport: &'a dyn LlmTransport,
    pub dispatcher: &'a mut ToolDispatcher,
    pub config: &'a RuntimeConfig,
    pub has_task_completed_tool: bool,
}

impl<'a> StepExecutor<'a> {
    /// Run exactly one turn. `step_prompt` is the freshly templated prompt
    /// for this step; `system` is the assembled system prompt; `n` is the
    /// requested alternative-completion count (1 for the normal path).
    /// `is_compact_command` reflects whether the run's actual first-turn
    /// user prompt was `/compact`, decided by the caller (the templated
    /// `step_prompt` itself is never the literal user input, so this can't
    /// be derived from it here).
    pub async fn run_turn(
        &mut self,
        state: &mut AgentState,
        model: &str,
        _system: &str,
        step_prompt: String,
        tools_schema: &Value,
        n: u32,
        is_compact_command: bool,
        on_cost: &dyn Fn(Credit),
        sink: ResponseSink<'_>,
    ) -> Result<StepOutcome, RuntimeError> {
        if state.steps_remaining == 0 {
            state.message_history.expire(ExpireBoundary::EndOfUserPrompt);
            state
                .message_history
                .append(Message::new(Role::User, STEP_WARNING_MESSAGE).with_tag("system"));
            emit_safely(sink, ResponseEvent::Error(STEP_WARNING_MESSAGE.to_string()));
            return Ok(StepOutcome {
                end_turn: true,
                n_responses: None,
            });
        }

        let step_message = Message::new(Role::User, step_prompt)
            .with_ttl(MessageTtl::AgentStep)
            .keep();
        state.message_history.append(step_message);

        if n > 1 {
            let raw = self
                .transport
                .prompt(state.message_history.as_slice(), model, n, on_cost)
                .await?;
            let responses: Vec<String> = serde_json::from_str(&raw).unwrap_or_else(|_| vec![raw]);
            state.steps_remaining -= 1;
            return Ok(StepOutcome {
                end_turn: false,
                n_responses: Some(responses),
            });
        }

        let receiver = self
            .transport
            .prompt_stream(state.message_history.as_slice(), model, tools_schema, on_cost)
            .await?;

        let outcome = StreamProcessor::new(self.dispatcher)
            .run(receiver, sink)
            .await?;

        if !outcome.assistant_text.is_empty() {
            state
                .message_history
                .append(Message::new(Role::Assistant, outcome.assistant_text.clone()));
        }
        for tool_message in outcome.tool_messages {
            state.message_history.append(tool_message);
        }

        state.message_history.expire(ExpireBoundary::EndOfAgentStep);

        if is_compact_command {
            let summary = outcome.assistant_text.clone();
            state.message_history.replace_all(
                Message::new(Role::User, format!("<system>{summary}</system>")).keep(),
            );
        }

        let has_explicit_end = outcome
            .tool_calls
            .iter()
            .any(|c| c.tool_name == "task_completed" || c.tool_name == "end_turn");

        let has_no_work = !outcome.had_tool_call_error
            && outcome
                .tool_calls
                .iter()
                .all(|c| TOOLS_WHICH_WONT_FORCE_NEXT_STEP.contains(&c.tool_name.as_str()));

        let should_end_turn = if self.has_task_completed_tool {
            has_explicit_end
        } else {
            has_explicit_end || has_no_work
        };

        state.steps_remaining -= 1;

        Ok(StepOutcome {
            end_turn: should_end_turn,
            n_responses: None,
        })
    }
}

/// Convenience wrapper used by callers that already hold an `Arc` transport.
pub fn as_transport_ref(transport: &Arc<dyn LlmTransport>) -> &dyn LlmTransport {
    transport.as_ref()
}
