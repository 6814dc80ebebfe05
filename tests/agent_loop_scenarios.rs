//! End-to-end scenarios for the agent runtime, driven against fake
//! transport/storage contracts instead of any real provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use agent_runtime::runtime::agent_loop::{AgentLoop, CancellationToken, InvokeRequest, RuntimeServices};
use agent_runtime::runtime::config::RuntimeConfig;
use agent_runtime::runtime::contracts::{
    AgentStepRecord, LlmTransport, RunStorage, TokenCountResult,
};
use agent_runtime::runtime::errors::RuntimeError;
use agent_runtime::runtime::message::Message;
use agent_runtime::runtime::sink::ResponseEvent;
use agent_runtime::runtime::stream::{ChannelStreamReceiver, RawStreamChunk, RawStreamReceiver};
use agent_runtime::runtime::template::{AgentTemplate, AgentTemplateRef, Credit, RunStatus};

struct ScriptedTransport {
    /// One script (a vec of raw chunks) per call to `prompt_stream`, consumed in order.
    turns: Mutex<Vec<Vec<RawStreamChunk>>>,
    calls: AtomicU32,
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn prompt_stream(
        &self,
        _messages: &[Message],
        _model: &str,
        _tools: &Value,
        _on_cost: &dyn Fn(Credit),
    ) -> Result<Box<dyn RawStreamReceiver>, RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.turns.lock().unwrap().remove(0);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for chunk in script {
                let _ = tx.send(chunk).await;
            }
        });
        Ok(Box::new(ChannelStreamReceiver::new(rx)))
    }

    async fn prompt(
        &self,
        _messages: &[Message],
        _model: &str,
        _n: u32,
        _on_cost: &dyn Fn(Credit),
    ) -> Result<String, RuntimeError> {
        Ok("unused".to_string())
    }

    async fn count_tokens(&self, _messages: &[Message], _system: &str) -> TokenCountResult {
        TokenCountResult {
            input_tokens: Some(10),
            error: None,
        }
    }
}

struct FakeStorage;

#[async_trait]
impl RunStorage for FakeStorage {
    async fn start_agent_run(
        &self,
        _agent_id: Uuid,
        _ancestor_run_ids: &[Uuid],
    ) -> Result<Uuid, RuntimeError> {
        Ok(Uuid::new_v4())
    }

    async fn add_agent_step(&self, _step: AgentStepRecord) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn finish_agent_run(
        &self,
        _run_id: Uuid,
        _status: RunStatus,
        _total_steps: u32,
        _direct_credits: Credit,
        _total_credits: Credit,
        _error_message: Option<String>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

fn plain_template(id: &str, has_task_completed: bool) -> AgentTemplate {
    AgentTemplate {
        reference: AgentTemplateRef::new(id),
        model: "test-model".to_string(),
        system_prompt_fragments: vec!["You are a test agent.".to_string()],
        instructions_prompt_fragment: Some("Proceed.".to_string()),
        tool_names: if has_task_completed {
            vec!["task_completed".to_string()]
        } else {
            vec![]
        },
        spawnable_agents: vec![],
        input_prompt_schema: None,
        input_params_schema: None,
        output_schema: None,
        inherit_parent_system_prompt: false,
        include_message_history: false,
        step_handler_factory: None,
    }
}

fn services(transport: ScriptedTransport) -> Arc<RuntimeServices> {
    Arc::new(RuntimeServices {
        transport: Arc::new(transport),
        storage: Arc::new(FakeStorage),
        analytics: None,
        template_registry: None,
        remote_tools: None,
        local_templates: std::collections::HashMap::new(),
        config: RuntimeConfig::default(),
        loop_guard: None,
    })
}

#[tokio::test]
async fn scenario_basic_turn_end_via_task_completed() {
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![vec![
            RawStreamChunk::TextDelta {
                text: "Working on it.".to_string(),
            },
            RawStreamChunk::ToolCallStart {
                id: "1".to_string(),
                name: "task_completed".to_string(),
            },
            RawStreamChunk::ToolCallEnd { id: "1".to_string() },
            RawStreamChunk::Finish {
                message_id: "m1".to_string(),
            },
        ]]),
        calls: AtomicU32::new(0),
    };
    let services = services(transport);
    let loop_ = AgentLoop::new(services, CancellationToken::new());
    let template = plain_template("base", true);

    let events: Mutex<Vec<ResponseEvent>> = Mutex::new(Vec::new());
    let sink = |e: ResponseEvent| events.lock().unwrap().push(e);

    let request = InvokeRequest {
        template: &template,
        prompt: Some("Do the thing.".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    let (state, _output) = loop_.run(request, &sink).await.expect("run succeeds");
    assert_eq!(state.steps_remaining, 24); // decremented exactly once
}

#[tokio::test]
async fn scenario_no_work_termination() {
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![vec![
            RawStreamChunk::TextDelta {
                text: "All done, nothing left to do.".to_string(),
            },
            RawStreamChunk::Finish {
                message_id: "m1".to_string(),
            },
        ]]),
        calls: AtomicU32::new(0),
    };
    let services = services(transport);
    let loop_ = AgentLoop::new(services, CancellationToken::new());
    let template = plain_template("researcher", false);

    let sink = |_: ResponseEvent| {};
    let request = InvokeRequest {
        template: &template,
        prompt: Some("Summarize.".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    let (state, _output) = loop_.run(request, &sink).await.expect("run succeeds");
    assert_eq!(state.steps_remaining, 24);
}

#[tokio::test]
async fn scenario_force_end_on_budget() {
    let template = plain_template("researcher", false);
    let events: Mutex<Vec<ResponseEvent>> = Mutex::new(Vec::new());
    let sink = |e: ResponseEvent| events.lock().unwrap().push(e);
    let request = InvokeRequest {
        template: &template,
        prompt: Some("Go.".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    // No scripted turns: with a zero step budget the loop must force-end
    // before ever calling the transport.
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![]),
        calls: AtomicU32::new(0),
    };
    let mut cfg = RuntimeConfig::default();
    cfg.default_child_steps = 0;
    let services = Arc::new(RuntimeServices {
        transport: Arc::new(transport),
        storage: Arc::new(FakeStorage),
        analytics: None,
        template_registry: None,
        remote_tools: None,
        local_templates: std::collections::HashMap::new(),
        config: cfg,
        loop_guard: None,
    });
    let loop_ = AgentLoop::new(services, CancellationToken::new());
    let (state, _output) = loop_.run(request, &sink).await.expect("run succeeds");
    assert_eq!(state.steps_remaining, 0);

    let events = events.lock().unwrap();
    assert!(
        events.iter().any(|e| matches!(e, ResponseEvent::Error(message) if message.contains("Step budget exhausted"))),
        "sink must receive the step-budget warning text"
    );
}

#[tokio::test]
async fn scenario_cancellation_short_circuits() {
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![]),
        calls: AtomicU32::new(0),
    };
    let services = services(transport);
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let loop_ = AgentLoop::new(services, cancellation);
    let template = plain_template("researcher", false);

    let sink = |_: ResponseEvent| {};
    let request = InvokeRequest {
        template: &template,
        prompt: Some("Go.".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    let (_state, output) = loop_.run(request, &sink).await.expect("run resolves, not errors");
    match output {
        agent_runtime::runtime::template::AgentOutput::Error { message, .. } => {
            assert_eq!(message, "Run cancelled by user");
        }
        _ => panic!("expected a cancellation error output"),
    }
}

#[tokio::test]
async fn scenario_spawn_permission_denied() {
    // A non-base agent with no `spawnableAgents` entries tries to spawn an
    // unrelated template; the request is rejected and surfaced as a tool
    // error rather than aborting the run.
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![
            vec![
                RawStreamChunk::ToolCallStart {
                    id: "1".to_string(),
                    name: "spawn_agents".to_string(),
                },
                RawStreamChunk::ToolCallDelta {
                    id: "1".to_string(),
                    partial_json: r#"{"agents":[{"template":"helper","prompt":"go"}]}"#.to_string(),
                },
                RawStreamChunk::ToolCallEnd { id: "1".to_string() },
                RawStreamChunk::Finish {
                    message_id: "m1".to_string(),
                },
            ],
            vec![
                RawStreamChunk::TextDelta {
                    text: "All done, nothing left to do.".to_string(),
                },
                RawStreamChunk::Finish {
                    message_id: "m2".to_string(),
                },
            ],
        ]),
        calls: AtomicU32::new(0),
    };
    let services = services(transport);
    let loop_ = AgentLoop::new(services, CancellationToken::new());

    let template = AgentTemplate {
        reference: AgentTemplateRef::new("researcher"),
        model: "test-model".to_string(),
        system_prompt_fragments: vec!["You are a test agent.".to_string()],
        instructions_prompt_fragment: Some("Proceed.".to_string()),
        tool_names: vec!["spawn_agents".to_string()],
        spawnable_agents: vec![],
        input_prompt_schema: None,
        input_params_schema: None,
        output_schema: None,
        inherit_parent_system_prompt: false,
        include_message_history: false,
        step_handler_factory: None,
    };

    let events: Mutex<Vec<ResponseEvent>> = Mutex::new(Vec::new());
    let sink = |e: ResponseEvent| events.lock().unwrap().push(e);
    let request = InvokeRequest {
        template: &template,
        prompt: Some("Spawn a helper.".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    let (_state, _output) = loop_.run(request, &sink).await.expect("run succeeds");

    let events = events.lock().unwrap();
    let saw_denial = events.iter().any(|e| match e {
        ResponseEvent::Error(message) => message.contains("may not spawn"),
        _ => false,
    });
    assert!(saw_denial, "expected a spawn-permission-denied error event");
    let saw_subagent_start = events
        .iter()
        .any(|e| matches!(e, ResponseEvent::SubagentStart { .. }));
    assert!(!saw_subagent_start, "denied spawn must never start a child run");
}

#[tokio::test]
async fn scenario_compact_command_replaces_history() {
    // A `/compact` user prompt collapses the entire transcript down to a
    // single system summary message once the turn's stream finishes.
    let transport = ScriptedTransport {
        turns: Mutex::new(vec![vec![
            RawStreamChunk::TextDelta {
                text: "Summary of everything so far.".to_string(),
            },
            RawStreamChunk::ToolCallStart {
                id: "1".to_string(),
                name: "task_completed".to_string(),
            },
            RawStreamChunk::ToolCallEnd { id: "1".to_string() },
            RawStreamChunk::Finish {
                message_id: "m1".to_string(),
            },
        ]]),
        calls: AtomicU32::new(0),
    };
    let services = services(transport);
    let loop_ = AgentLoop::new(services, CancellationToken::new());
    let template = plain_template("base", true);

    let sink = |_: ResponseEvent| {};
    let request = InvokeRequest {
        template: &template,
        prompt: Some("/compact".to_string()),
        params: None,
        native_tools: vec![],
        parent_system_prompt: None,
        parent_tools_schema: None,
        seed_history: vec![],
        depth: 0,
        parent_lineage: None,
    };

    let (state, _output) = loop_.run(request, &sink).await.expect("run succeeds");

    let messages = state.message_history.as_slice();
    assert_eq!(messages.len(), 1, "compact must collapse history to one message");
    match &messages[0].content {
        agent_runtime::runtime::message::MessageContent::Plain(text) => {
            assert!(text.contains("Summary of everything so far."));
        }
        other => panic!("expected a plain summary message, got {other:?}"),
    }
}
