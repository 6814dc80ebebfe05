//! Agent Loop: drives a run to completion, interleaving LLM turns with an
//! optional programmatic step handler, and recursively spawning children.
//!
//! Grounded on `crewai::flow::flow`'s explicit event/state-driven
//! execution (the closest thing in the teacher to a suspend/resume
//! workflow engine) for the shape of [`StepHandler`] as a boxed async
//! state machine rather than a native generator, and on
//! `crewai::agent::core::Agent::execute_task`/`kickoff` for the
//! overall "assemble prompt, run, process results, report" shape of one
//! top-level invocation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

use dashmap::DashMap;
use dashmap::DashSet;
use once_cell::sync::Lazy;
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::contracts::{
    Analytics, AgentStepRecord, LlmTransport, RunStorage, StepRecordStatus, TemplateRegistry,
};
use super::dispatcher::{
    LoopGuard, NativeTool, RemoteToolExecutor, SpawnRouter, ToolCallRequest, ToolDispatcher,
};
use super::errors::RuntimeError;
use super::message::{ContentPart, ExpireBoundary, Message, MessageStore, Role};
use super::sink::{emit_safely, ResponseEvent, ResponseSink};
use super::step::StepExecutor;
use super::template::{AgentOutput, AgentState, AgentTemplate, AgentTemplateRef, Credit, RunStatus};

/// One resumption input handed to a [`StepHandler`].
pub struct StepResumeInput {
    pub tool_result: Option<Vec<ContentPart>>,
    pub steps_complete: bool,
    pub n_responses: Option<Vec<String>>,
}

/// What a [`StepHandler`] asks the agent loop to do next.
pub enum StepYield {
    /// Run one ordinary LLM turn, then resume the handler.
    Step,
    /// Enter step-all mode: run LLM turns without re-entering the handler
    /// until the turn naturally ends.
    StepAll,
    /// Inject `text` as if the LLM had produced it (parsed for inline tool
    /// calls, which execute before the handler resumes).
    StepText(String),
    /// Request `n` parallel completions for the next turn.
    GenerateN(u32),
    /// Execute one tool call as if the agent had issued it.
    ToolCall {
        tool_name: String,
        input: serde_json::Value,
        include_in_history: bool,
    },
    /// The handler has no more work; end the turn.
    Done,
}

/// A programmatic step handler: a boxed coroutine, modeled as an async
/// state machine since this crate has no first-class generators. Created
/// fresh per run by `AgentTemplate::step_handler_factory` and stored in
/// the [`GeneratorRegistry`] between agent-loop iterations.
pub trait StepHandler: Send {
    /// Resolves to the handler's next yield, or `Err(message)` if the
    /// handler itself failed. A handler error ends the turn immediately:
    /// it is reported as an assistant message, recorded as the output
    /// error, and the step is stored with `status = skipped`.
    fn resume<'a>(
        &'a mut self,
        input: StepResumeInput,
    ) -> Pin<Box<dyn Future<Output = Result<StepYield, String>> + Send + 'a>>;
}

/// Process-wide registry of live step handlers, keyed by `runId`, plus the
/// set of runs currently in step-all mode. The only shared mutable state
/// in the runtime (§5).
pub struct GeneratorRegistry {
    handlers: DashMap<Uuid, Arc<AsyncMutex<Box<dyn StepHandler>>>>,
    step_all_runs: DashSet<Uuid>,
}

impl GeneratorRegistry {
    fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            step_all_runs: DashSet::new(),
        }
    }

    pub fn insert(&self, run_id: Uuid, handler: Box<dyn StepHandler>) {
        self.handlers.insert(run_id, Arc::new(AsyncMutex::new(handler)));
    }

    pub fn get(&self, run_id: &Uuid) -> Option<Arc<AsyncMutex<Box<dyn StepHandler>>>> {
        self.handlers.get(run_id).map(|e| e.clone())
    }

    pub fn remove(&self, run_id: &Uuid) {
        self.handlers.remove(run_id);
        self.step_all_runs.remove(run_id);
    }

    pub fn is_step_all(&self, run_id: &Uuid) -> bool {
        self.step_all_runs.contains(run_id)
    }

    pub fn set_step_all(&self, run_id: Uuid, value: bool) {
        if value {
            self.step_all_runs.insert(run_id);
        } else {
            self.step_all_runs.remove(&run_id);
        }
    }
}

/// Global generator registry. A `Lazy<...>` singleton, matching the
/// teacher's pattern for process-wide registries (e.g. the global hook
/// lists in `crewai::hooks`).
pub static GENERATOR_REGISTRY: Lazy<GeneratorRegistry> = Lazy::new(GeneratorRegistry::new);

/// Cooperative cancellation flag threaded through one run tree.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.inner.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Everything the agent loop needs that is external to one run: injected
/// contracts, shared across the whole run tree.
pub struct RuntimeServices {
    pub transport: Arc<dyn LlmTransport>,
    pub storage: Arc<dyn RunStorage>,
    pub analytics: Option<Arc<dyn Analytics>>,
    pub template_registry: Option<Arc<dyn TemplateRegistry>>,
    pub remote_tools: Option<Arc<dyn RemoteToolExecutor>>,
    /// Templates known up front (e.g. a crew's own member agents), checked
    /// before falling back to `template_registry` when resolving a
    /// `spawn_agents` target.
    pub local_templates: HashMap<String, Arc<AgentTemplate>>,
    pub config: RuntimeConfig,
    /// Optional stuck-loop detector shared across every dispatcher this
    /// service set constructs. Left unset, dispatch never blocks a call on
    /// these grounds.
    pub loop_guard: Option<Arc<dyn LoopGuard>>,
}

/// Invocation-scoped request to start (or continue) one agent.
pub struct InvokeRequest<'a> {
    pub template: &'a AgentTemplate,
    pub prompt: Option<String>,
    pub params: Option<serde_json::Value>,
    pub native_tools: Vec<Arc<dyn NativeTool>>,
    pub parent_system_prompt: Option<String>,
    pub parent_tools_schema: Option<serde_json::Value>,
    /// Seeded from a parent's filtered history when spawned as a child with
    /// `include_message_history` set; empty for a top-level invocation.
    pub seed_history: Vec<Message>,
    pub depth: usize,
    /// The parent's `run_id` and `ancestor_run_ids`, for a spawned child.
    /// `None` for a top-level invocation. §3 requires
    /// `child.ancestorRunIds = parent.ancestorRunIds ++ [parent.runId]`.
    pub parent_lineage: Option<(Uuid, Vec<Uuid>)>,
}

/// Drives one agent (and, recursively, its children) to completion.
pub struct AgentLoop {
    pub services: Arc<RuntimeServices>,
    pub cancellation: CancellationToken,
}

impl AgentLoop {
    pub fn new(services: Arc<RuntimeServices>, cancellation: CancellationToken) -> Self {
        Self {
            services,
            cancellation,
        }
    }

    /// Run one agent invocation to completion, returning its final state
    /// and output. Recurses for `spawn_agents` calls.
    pub fn run<'a>(
        &'a self,
        request: InvokeRequest<'a>,
        sink: ResponseSink<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<(AgentState, AgentOutput), RuntimeError>> + 'a>> {
        Box::pin(async move { self.run_inner(request, sink).await })
    }

    async fn run_inner<'a>(
        &'a self,
        request: InvokeRequest<'a>,
        sink: ResponseSink<'a>,
    ) -> Result<(AgentState, AgentOutput), RuntimeError> {
        if self.cancellation.is_cancelled() {
            return Ok((
                AgentState::new(request.template.reference.clone(), 0),
                AgentOutput::Error {
                    message: "Run cancelled by user".to_string(),
                    status_code: None,
                },
            ));
        }

        if request.depth >= self.services.config.max_agent_depth {
            return Err(RuntimeError::SpawnValidationFailed {
                child: request.template.reference.id.clone(),
                message: "maximum agent recursion depth exceeded".to_string(),
            });
        }

        let mut state = AgentState::new(
            request.template.reference.clone(),
            self.services.config.default_child_steps,
        );

        if let Some((parent_run_id, parent_ancestor_run_ids)) = &request.parent_lineage {
            state.parent_id = Some(*parent_run_id);
            state.ancestor_run_ids = parent_ancestor_run_ids
                .iter()
                .copied()
                .chain(std::iter::once(*parent_run_id))
                .collect();
        }

        if !request.seed_history.is_empty() {
            state.message_history = MessageStore::from_messages(request.seed_history.clone());
            state.message_history.append(
                Message::new(
                    Role::User,
                    "(spawned as a subagent, inheriting the parent's message history up to this point)",
                )
                .with_tag("SUBAGENT_SPAWN"),
            );
        }

        let run_id = self
            .services
            .storage
            .start_agent_run(state.agent_id, &state.ancestor_run_ids)
            .await
            .map_err(|e| RuntimeError::StorageFailure(e.to_string()))?;
        state.run_id = Some(run_id);
        log::debug!(
            "run {run_id} started: agent_type={} depth={}",
            request.template.reference.id,
            request.depth
        );

        let system_prompt = if request.template.inherit_parent_system_prompt {
            request
                .parent_system_prompt
                .clone()
                .unwrap_or_else(|| request.template.system_prompt_fragments.join("\n"))
        } else {
            request.template.system_prompt_fragments.join("\n")
        };

        let mut dispatcher = ToolDispatcher::new(request.template.reference.id.clone());
        for tool in &request.native_tools {
            dispatcher.register_native(tool.clone());
        }
        dispatcher.set_permitted_tools(request.template.tool_names.clone());
        if let Some(remote) = &self.services.remote_tools {
            dispatcher.set_remote_executor(remote.clone());
        }
        if let Some(guard) = &self.services.loop_guard {
            dispatcher.set_loop_guard(guard.clone());
        }
        dispatcher.set_max_output_chars(self.services.config.tool_output_truncate_chars);
        for child_ref in &request.template.spawnable_agents {
            dispatcher.register_spawnable(child_ref.id.clone(), child_ref.clone());
        }

        let tools_schema = request
            .parent_tools_schema
            .clone()
            .filter(|_| request.template.inherit_parent_system_prompt)
            .unwrap_or_else(|| serde_json::json!({ "tools": request.template.tool_names }));

        if let Some(prompt) = &request.prompt {
            let mut user_message = Message::new(
                Role::User,
                format_prompt_with_params(prompt, request.params.as_ref()),
            )
            .with_tag("USER_PROMPT")
            .keep();
            user_message.ttl = None;
            state.message_history.append(user_message);
        }
        if let Some(instructions) = &request.template.instructions_prompt_fragment {
            state
                .message_history
                .append(Message::new(Role::User, instructions.clone()).with_tag("INSTRUCTIONS_PROMPT"));
        }

        if let Some(factory) = &request.template.step_handler_factory {
            GENERATOR_REGISTRY.insert(run_id, factory());
        }

        let result = self
            .drive_steps(
                &mut state,
                request.template,
                &system_prompt,
                &mut dispatcher,
                &tools_schema,
                &request.native_tools,
                request.depth,
                request.prompt.as_deref(),
                sink,
            )
            .await;

        GENERATOR_REGISTRY.remove(&run_id);

        if self.services.config.clear_user_prompt_messages_after_response {
            state.message_history.expire(ExpireBoundary::EndOfUserPrompt);
        }

        match result {
            Ok(()) => {
                let status = if self.cancellation.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Completed
                };
                self.services
                    .storage
                    .finish_agent_run(
                        run_id,
                        status,
                        self.services.config.default_child_steps - state.steps_remaining,
                        state.direct_credits_used,
                        state.credits_used,
                        None,
                    )
                    .await
                    .map_err(|e| RuntimeError::StorageFailure(e.to_string()))?;

                log::info!(
                    "run {run_id} finished: status={status:?} credits_used={}",
                    state.credits_used
                );
                let output = state.output.clone().unwrap_or(AgentOutput::Error {
                    message: "no output set".to_string(),
                    status_code: None,
                });
                Ok((state, output))
            }
            Err(err) => {
                log::error!(
                    "run {run_id} (agent_type={}) terminated with an uncaught error: {err}",
                    state.agent_type.id
                );
                if err.is_payment_required() {
                    return Err(err);
                }
                let status = if self.cancellation.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                let _ = self
                    .services
                    .storage
                    .finish_agent_run(
                        run_id,
                        status,
                        self.services.config.default_child_steps - state.steps_remaining,
                        state.direct_credits_used,
                        state.credits_used,
                        Some(err.to_string()),
                    )
                    .await;
                let message = if self.cancellation.is_cancelled() {
                    "Run cancelled by user".to_string()
                } else {
                    err.to_string()
                };
                Ok((
                    state,
                    AgentOutput::Error {
                        message,
                        status_code: err.status_code(),
                    },
                ))
            }
        }
    }

    async fn drive_steps<'a>(
        &'a self,
        state: &mut AgentState,
        template: &'a AgentTemplate,
        system_prompt: &str,
        dispatcher: &mut ToolDispatcher,
        tools_schema: &serde_json::Value,
        native_tools: &[Arc<dyn NativeTool>],
        depth: usize,
        initial_prompt: Option<&str>,
        sink: ResponseSink<'a>,
    ) -> Result<(), RuntimeError> {
        let run_id = state.run_id.expect("run_id set before drive_steps");
        let mut pending_n: u32 = 1;
        let mut pending_responses: Option<Vec<String>> = None;
        let mut pending_tool_result: Option<Vec<ContentPart>> = None;
        let mut last_step_ended = false;
        let mut is_first_turn = true;

        let spawnable_short_names: HashMap<String, AgentTemplateRef> = template
            .spawnable_agents
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();

        loop {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }

            let accumulator = Arc::new(StdMutex::new(SpawnAccumulator::default()));
            dispatcher.set_spawn_router(Box::new(LoopSpawnRouter {
                services: self.services.clone(),
                cancellation: self.cancellation.clone(),
                parent_ref: template.reference.clone(),
                parent_run_id: run_id,
                parent_ancestor_run_ids: state.ancestor_run_ids.clone(),
                parent_is_base_agent: template.is_base_agent(),
                spawnable_agents: template.spawnable_agents.clone(),
                spawnable_short_names: spawnable_short_names.clone(),
                native_tools: native_tools.to_vec(),
                tools_schema: tools_schema.clone(),
                system_prompt: system_prompt.to_string(),
                depth,
                history_snapshot: state.message_history.filter_unfinished_tool_calls(),
                accumulator: accumulator.clone(),
            }));

            let token_estimate = self
                .services
                .transport
                .count_tokens(state.message_history.as_slice(), system_prompt)
                .await;
            state.context_token_count = token_estimate.input_tokens.unwrap_or_else(|| {
                state
                    .message_history
                    .as_slice()
                    .iter()
                    .map(|_| 0u64)
                    .sum::<u64>()
                    .max(1)
            });

            let mut should_end_turn = false;
            let mut skip_llm_turn = false;

            if GENERATOR_REGISTRY.get(&run_id).is_some() && !GENERATOR_REGISTRY.is_step_all(&run_id) {
                let handler = GENERATOR_REGISTRY.get(&run_id).unwrap();
                let mut handler = handler.lock().await;
                let yielded = handler
                    .resume(StepResumeInput {
                        tool_result: pending_tool_result.take(),
                        steps_complete: last_step_ended,
                        n_responses: pending_responses.take(),
                    })
                    .await;
                match yielded {
                    Err(handler_error) => {
                        state.message_history.append(Message::new(
                            Role::Assistant,
                            format!("step handler error: {handler_error}"),
                        ));
                        state.output = Some(AgentOutput::Error {
                            message: handler_error.clone(),
                            status_code: None,
                        });
                        let step_number = self
                            .services
                            .config
                            .default_child_steps
                            .saturating_sub(state.steps_remaining);
                        let _ = self
                            .services
                            .storage
                            .add_agent_step(skipped_step_record(run_id, step_number, handler_error))
                            .await;
                        should_end_turn = true;
                        skip_llm_turn = true;
                    }
                    Ok(StepYield::Done) => {
                        should_end_turn = true;
                    }
                    Ok(StepYield::StepAll) => {
                        GENERATOR_REGISTRY.set_step_all(run_id, true);
                    }
                    Ok(StepYield::GenerateN(n)) => {
                        pending_n = n;
                    }
                    Ok(StepYield::ToolCall {
                        tool_name,
                        input,
                        include_in_history,
                    }) => {
                        let call = ToolCallRequest {
                            tool_call_id: Uuid::new_v4().to_string(),
                            tool_name,
                            input,
                        };
                        let outcome = dispatcher.dispatch(&call, sink).await;
                        let parts = outcome.unwrap_or_default();
                        if include_in_history {
                            state
                                .message_history
                                .append(Message::new(Role::Tool, super::message::MessageContent::Parts(parts.clone())));
                        }
                        pending_tool_result = Some(parts);
                        skip_llm_turn = true;
                    }
                    Ok(StepYield::StepText(text)) => {
                        let (cleaned, inline_calls) = super::stream::extract_inline_tool_calls(&text);
                        if !cleaned.trim().is_empty() {
                            state.message_history.append(Message::new(Role::Assistant, cleaned));
                        }
                        let mut results = Vec::new();
                        for (tool_name, input) in inline_calls {
                            let call = ToolCallRequest {
                                tool_call_id: Uuid::new_v4().to_string(),
                                tool_name,
                                input,
                            };
                            let outcome = dispatcher.dispatch(&call, sink).await;
                            results.extend(outcome.unwrap_or_default());
                        }
                        if !results.is_empty() {
                            state.message_history.append(Message::new(
                                Role::Tool,
                                super::message::MessageContent::Parts(results.clone()),
                            ));
                        }
                        pending_tool_result = Some(results);
                        skip_llm_turn = true;
                    }
                    Ok(StepYield::Step) => {}
                }
            }

            {
                let mut acc = accumulator.lock().unwrap();
                state.child_run_ids.append(&mut acc.child_run_ids);
                state.absorb_child_cost(acc.credits);
                acc.credits = 0.0;
            }

            if should_end_turn && skip_llm_turn {
                break;
            }

            if skip_llm_turn {
                continue;
            }

            if self.check_output_schema_retry(state, template, should_end_turn) {
                should_end_turn = false;
            } else if should_end_turn {
                break;
            }

            let step_prompt = render_step_prompt(template, state);
            let mut step_executor = StepExecutor {
                transport: self.services.transport.as_ref(),
                dispatcher,
                config: &self.services.config,
                has_task_completed_tool: template
                    .tool_names
                    .iter()
                    .any(|t| t == "task_completed"),
            };

            let n = std::mem::replace(&mut pending_n, 1);
            let is_compact_command = is_first_turn
                && initial_prompt
                    .map(|p| {
                        let t = p.trim();
                        t.eq_ignore_ascii_case("/compact") || t.eq_ignore_ascii_case("compact")
                    })
                    .unwrap_or(false);
            is_first_turn = false;
            let step_cost = std::cell::Cell::new(0.0_f64);
            let outcome = step_executor
                .run_turn(
                    state,
                    &template.model,
                    system_prompt,
                    step_prompt,
                    tools_schema,
                    n,
                    is_compact_command,
                    &|credits| step_cost.set(step_cost.get() + credits),
                    sink,
                )
                .await?;
            state.add_direct_cost(step_cost.get());

            state.message_history.trim_to_token_budget(
                estimate_system_tokens(system_prompt),
                default_context_window(),
                self.services.config.shortened_token_factor,
                self.services.config.terminal_output_keep_count,
            );

            let turn_child_run_ids = {
                let mut acc = accumulator.lock().unwrap();
                let ids = std::mem::take(&mut acc.child_run_ids);
                state.child_run_ids.extend(ids.iter().copied());
                state.absorb_child_cost(acc.credits);
                acc.credits = 0.0;
                ids
            };

            let step_number = self
                .services
                .config
                .default_child_steps
                .saturating_sub(state.steps_remaining);
            let _ = self
                .services
                .storage
                .add_agent_step(completed_step_record(
                    run_id,
                    step_number,
                    step_cost.get(),
                    turn_child_run_ids,
                    None,
                ))
                .await;

            last_step_ended = outcome.end_turn;

            // Alternative completions from a `GenerateN` request are handed
            // to the handler's next resumption rather than appended here —
            // the handler decides which (if any) becomes the turn's actual
            // output, typically via `StepText`.
            pending_responses = outcome.n_responses;

            if outcome.end_turn {
                if GENERATOR_REGISTRY.is_step_all(&run_id) {
                    // A step-all run ends one turn at a time but keeps
                    // control with the LLM until the handler says otherwise;
                    // drop back into step-by-step mode and let the handler
                    // decide whether to keep going.
                    GENERATOR_REGISTRY.set_step_all(run_id, false);
                    continue;
                }
                break;
            }
        }

        Ok(())
    }

    /// Implements the output-schema one-shot retry. Returns `true` if the
    /// turn should be forced to continue for another attempt.
    ///
    /// `has_retried_output_schema` is intentionally never reset once set —
    /// this preserves the original runtime's one-shot-then-give-up
    /// behavior rather than silently making it an infinite retry.
    fn check_output_schema_retry(
        &self,
        state: &mut AgentState,
        template: &AgentTemplate,
        should_end_turn: bool,
    ) -> bool {
        if !should_end_turn || template.output_schema.is_none() || state.output.is_some() {
            return false;
        }
        if state.has_retried_output_schema {
            return false;
        }
        state.has_retried_output_schema = true;
        state.message_history.append(
            Message::new(
                Role::User,
                "You must call set_output with a value matching the required output schema before finishing.",
            )
            .keep(),
        );
        true
    }

}

/// Accumulates what recursive spawns produced during one turn, drained into
/// the parent [`AgentState`] by `AgentLoop::drive_steps` right after the
/// turn that triggered them finishes. A spawn router has no direct access
/// to the parent's `AgentState` (it's built fresh each iteration from
/// owned/`Arc` data so it can be stored behind `Box<dyn SpawnRouter>`), so
/// this is the handoff point instead.
#[derive(Default)]
struct SpawnAccumulator {
    child_run_ids: Vec<Uuid>,
    credits: Credit,
}

/// Resolves and runs recursive `spawn_agents` calls (and the agent-as-tool
/// rewrite) on behalf of one turn's [`ToolDispatcher`]. Built fresh each
/// iteration of `drive_steps` from the parent's current template/state, so
/// it always sees an up-to-date `history_snapshot` without needing a
/// lifetime tied back into the loop.
struct LoopSpawnRouter {
    services: Arc<RuntimeServices>,
    cancellation: CancellationToken,
    parent_ref: AgentTemplateRef,
    parent_run_id: Uuid,
    parent_ancestor_run_ids: Vec<Uuid>,
    parent_is_base_agent: bool,
    spawnable_agents: Vec<AgentTemplateRef>,
    spawnable_short_names: HashMap<String, AgentTemplateRef>,
    native_tools: Vec<Arc<dyn NativeTool>>,
    tools_schema: serde_json::Value,
    system_prompt: String,
    depth: usize,
    history_snapshot: Vec<Message>,
    accumulator: Arc<StdMutex<SpawnAccumulator>>,
}

impl LoopSpawnRouter {
    fn may_spawn(&self, child: &AgentTemplateRef) -> bool {
        self.parent_is_base_agent
            || self.spawnable_agents.iter().any(|allowed| child.compatible_with(allowed))
    }

    async fn resolve_template(&self, id: &str) -> Result<Arc<AgentTemplate>, RuntimeError> {
        if let Some(template) = self.services.local_templates.get(id) {
            return Ok(template.clone());
        }
        let registry = self.services.template_registry.as_ref().ok_or_else(|| {
            RuntimeError::SpawnValidationFailed {
                child: id.to_string(),
                message: "no template registry configured to resolve this spawn target".to_string(),
            }
        })?;
        registry
            .get_agent_template(id)
            .await
            .map(Arc::new)
            .ok_or_else(|| RuntimeError::SpawnValidationFailed {
                child: id.to_string(),
                message: "unknown agent template".to_string(),
            })
    }

    /// Parses either a literal `spawn_agents` call's `agents` array or a
    /// single agent-as-tool rewrite call's direct `{prompt, params}` body
    /// into `(template id, prompt, params)` triples.
    fn parse_entries(
        &self,
        call: &ToolCallRequest,
    ) -> Result<Vec<(String, String, Option<serde_json::Value>)>, RuntimeError> {
        if call.tool_name != "spawn_agents" {
            let prompt = call.input.get("prompt").and_then(|v| v.as_str()).unwrap_or_default();
            let params = call.input.get("params").cloned();
            return Ok(vec![(call.tool_name.clone(), prompt.to_string(), params)]);
        }

        let agents = call
            .input
            .get("agents")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RuntimeError::ToolValidationFailed {
                tool_name: call.tool_name.clone(),
                message: "spawn_agents requires an \"agents\" array".to_string(),
            })?;

        agents
            .iter()
            .map(|entry| {
                let template_id = entry
                    .get("template")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuntimeError::ToolValidationFailed {
                        tool_name: call.tool_name.clone(),
                        message: "each spawn_agents entry needs a \"template\" id".to_string(),
                    })?;
                let prompt = entry.get("prompt").and_then(|v| v.as_str()).unwrap_or_default();
                let params = entry.get("params").cloned();
                Ok((template_id.to_string(), prompt.to_string(), params))
            })
            .collect()
    }

    async fn spawn_one(
        &self,
        template_id: String,
        prompt: String,
        params: Option<serde_json::Value>,
        sink: ResponseSink<'_>,
    ) -> Result<ContentPart, RuntimeError> {
        let child_ref = self
            .spawnable_short_names
            .get(&template_id)
            .cloned()
            .unwrap_or_else(|| AgentTemplateRef::new(template_id.clone()));

        if !self.may_spawn(&child_ref) {
            log::warn!(
                "spawn denied: parent={} child={}",
                self.parent_ref.id,
                child_ref.id
            );
            return Err(RuntimeError::SpawnPermissionDenied {
                parent: self.parent_ref.id.clone(),
                child: child_ref.id.clone(),
            });
        }

        let child_template = self.resolve_template(&child_ref.id).await?;
        log::debug!(
            "spawning child: parent={} child={} depth={}",
            self.parent_ref.id,
            child_template.reference.id,
            self.depth + 1
        );

        let marker = Uuid::new_v4().to_string();
        emit_safely(
            sink,
            ResponseEvent::SubagentStart {
                run_id: marker.clone(),
                agent_type: child_template.reference.id.clone(),
            },
        );

        let seed_history = if child_template.include_message_history {
            self.history_snapshot.clone()
        } else {
            Vec::new()
        };

        let request = InvokeRequest {
            template: child_template.as_ref(),
            prompt: Some(prompt),
            params,
            native_tools: self.native_tools.clone(),
            parent_system_prompt: Some(self.system_prompt.clone()),
            parent_tools_schema: Some(self.tools_schema.clone()),
            seed_history,
            depth: self.depth + 1,
            parent_lineage: Some((self.parent_run_id, self.parent_ancestor_run_ids.clone())),
        };

        let child_loop = AgentLoop::new(self.services.clone(), self.cancellation.clone());
        let (child_state, output) = child_loop.run(request, sink).await?;

        {
            let mut acc = self.accumulator.lock().unwrap();
            if let Some(run_id) = child_state.run_id {
                acc.child_run_ids.push(run_id);
            }
            acc.credits += child_state.credits_used;
        }

        emit_safely(sink, ResponseEvent::SubagentFinish { run_id: marker });

        let text = match &output {
            AgentOutput::Value(v) => v.to_string(),
            AgentOutput::Error { message, .. } => format!("error: {message}"),
        };
        Ok(ContentPart::Text {
            text: format!("[{}] {}", child_template.reference.id, text),
        })
    }
}

impl SpawnRouter for LoopSpawnRouter {
    fn spawn<'a>(
        &'a self,
        call: &'a ToolCallRequest,
        sink: ResponseSink<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContentPart>, RuntimeError>> + 'a>> {
        Box::pin(async move {
            let entries = self.parse_entries(call)?;
            let mut results = Vec::with_capacity(entries.len());
            for (template_id, prompt, params) in entries {
                results.push(self.spawn_one(template_id, prompt, params, sink).await?);
            }
            Ok(results)
        })
    }
}

fn estimate_system_tokens(system_prompt: &str) -> u64 {
    (system_prompt.len() as u64 / 4).max(1)
}

fn default_context_window() -> u64 {
    128_000
}

fn render_step_prompt(template: &AgentTemplate, _state: &AgentState) -> String {
    template
        .instructions_prompt_fragment
        .clone()
        .unwrap_or_else(|| "Continue.".to_string())
}

fn format_prompt_with_params(prompt: &str, params: Option<&serde_json::Value>) -> String {
    match params {
        Some(p) if !p.is_null() => format!("{prompt}\n\nParameters: {p}"),
        _ => prompt.to_string(),
    }
}

/// Step record convenience builder for storage reporting.
pub fn completed_step_record(
    agent_run_id: Uuid,
    step_number: u32,
    credits: super::template::Credit,
    child_run_ids: Vec<Uuid>,
    message_id: Option<String>,
) -> AgentStepRecord {
    AgentStepRecord {
        agent_run_id,
        step_number,
        credits,
        child_run_ids,
        message_id,
        status: StepRecordStatus::Completed,
        error_message: None,
    }
}

/// Step record for a turn ended by a programmatic step handler failure
/// (§4.5 "Handler errors"): recorded with `status = skipped`, no credits.
fn skipped_step_record(agent_run_id: Uuid, step_number: u32, error_message: String) -> AgentStepRecord {
    AgentStepRecord {
        agent_run_id,
        step_number,
        credits: 0.0,
        child_run_ids: Vec::new(),
        message_id: None,
        status: StepRecordStatus::Skipped,
        error_message: Some(error_message),
    }
}
