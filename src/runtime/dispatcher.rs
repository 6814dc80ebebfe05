//! Tool dispatch: validate a requested call against the active template's
//! permitted tool set, route it to a handler, and report the result.
//!
//! Grounded on `crewai::tools::base_tool::BaseTool` (the native handler
//! trait shape) and `crewai::tools::tool_usage::ToolUsage` (select →
//! validate → execute → cache lifecycle), generalized: this runtime does
//! its own exact-name lookup (callers are trusted structured tool calls,
//! not free-text actions needing fuzzy correction) and adds the
//! `spawn_agents` permission path and the agent-as-tool rewrite that
//! `ToolUsage` has no equivalent for.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::RuntimeError;
use super::message::ContentPart;
use super::sink::{emit_safely, ResponseEvent, ResponseSink};
use super::template::AgentTemplateRef;
use crate::hooks::{run_after_tool_call_hooks, run_before_tool_call_hooks, ToolCallHookContext};

/// A parsed, not-yet-dispatched tool call.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// A native, in-process tool handler.
///
/// Mirrors `BaseTool::run`/`arun` but trades the teacher's type-erased
/// `Box<dyn Any>` input for a `serde_json::Value`, since every tool call
/// in this runtime already arrives JSON-shaped off the wire.
#[async_trait]
pub trait NativeTool: Send + Sync {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &Value;
    async fn call(&self, input: Value) -> Result<Vec<ContentPart>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Outcome of validating a call's tool name against the active template.
enum Route {
    Native(Arc<dyn NativeTool>),
    Remote { server: String, tool_name: String },
    SpawnAgents,
}

/// Routes and executes tool calls for one agent's turn.
pub struct ToolDispatcher {
    native_tools: HashMap<String, Arc<dyn NativeTool>>,
    /// Tool names permitted for the active template (includes namespaced
    /// `server/tool` entries for MCP routing).
    permitted: Vec<String>,
    agent_type_label: String,
    /// Names of template ids reachable as `spawn_agents` targets, keyed by
    /// the short name a model would naturally address them by.
    spawnable_short_names: HashMap<String, AgentTemplateRef>,
    remote_executor: Option<Arc<dyn RemoteToolExecutor>>,
    spawn_router: Option<Box<dyn SpawnRouter>>,
    loop_guard: Option<Arc<dyn LoopGuard>>,
    /// Character ceiling above which a single tool output's text parts are
    /// truncated (head + tail, middle replaced by an "N chars omitted"
    /// marker). `None` disables this independent of the runtime config
    /// default, for callers that want every byte preserved.
    max_output_chars: Option<usize>,
}

/// Host-supplied extension point for detecting an agent stuck calling the
/// same tool with the same arguments without making progress. The runtime
/// itself enforces no policy here — it only gives the host a place to plug
/// one in; a call the guard rejects is treated as validation failure.
pub trait LoopGuard: Send + Sync {
    /// Called before every dispatch. Returns `false` to block the call.
    fn allow(&self, tool_name: &str, input: &Value) -> bool;
}

/// Contract for MCP-routed tool execution, implemented by the host.
/// Grounded on `crewai::mcp::client`'s role as the remote-tool transport.
#[async_trait]
pub trait RemoteToolExecutor: Send + Sync {
    async fn call(
        &self,
        server: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<Vec<ContentPart>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Performs the actual recursive spawn for a `spawn_agents` call (or its
/// agent-as-tool rewrite). Implemented by the agent loop, which is the only
/// component holding the context (parent state, depth, system prompt) a
/// spawn needs; the dispatcher's job is only to recognize that a call
/// routes here and hand it off.
///
/// The method lifetime is late-bound rather than tied to the trait object,
/// so an implementor built entirely from owned/`Arc` data (as
/// `agent_loop::LoopSpawnRouter` is) can be stored as a plain `Box<dyn
/// SpawnRouter>` without infecting `ToolDispatcher` with a lifetime
/// parameter.
pub trait SpawnRouter: Send + Sync {
    fn spawn<'a>(
        &'a self,
        call: &'a ToolCallRequest,
        sink: ResponseSink<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContentPart>, RuntimeError>> + 'a>>;
}

impl ToolDispatcher {
    pub fn new(agent_type_label: impl Into<String>) -> Self {
        Self {
            native_tools: HashMap::new(),
            permitted: Vec::new(),
            agent_type_label: agent_type_label.into(),
            spawnable_short_names: HashMap::new(),
            remote_executor: None,
            spawn_router: None,
            loop_guard: None,
            max_output_chars: None,
        }
    }

    pub fn set_loop_guard(&mut self, guard: Arc<dyn LoopGuard>) {
        self.loop_guard = Some(guard);
    }

    pub fn set_max_output_chars(&mut self, max_chars: usize) {
        self.max_output_chars = Some(max_chars);
    }

    pub fn register_native(&mut self, tool: Arc<dyn NativeTool>) {
        self.native_tools.insert(tool.name().to_string(), tool);
    }

    pub fn set_remote_executor(&mut self, executor: Arc<dyn RemoteToolExecutor>) {
        self.remote_executor = Some(executor);
    }

    pub fn set_spawn_router(&mut self, router: Box<dyn SpawnRouter>) {
        self.spawn_router = Some(router);
    }

    pub fn set_permitted_tools(&mut self, tool_names: Vec<String>) {
        self.permitted = tool_names;
    }

    pub fn register_spawnable(&mut self, short_name: impl Into<String>, reference: AgentTemplateRef) {
        self.spawnable_short_names.insert(short_name.into(), reference);
    }

    /// Whether `tool_name` is reachable at all for this dispatcher's
    /// template — checked by the stream processor before emitting a
    /// `tool_call` sink event, so an unpermitted call never produces an
    /// orphan `tool_call` with no matching `tool_result` (§4.2).
    pub(crate) fn is_permitted(&self, tool_name: &str) -> bool {
        if self.permitted.iter().any(|p| p == tool_name) {
            return true;
        }
        // Namespaced remote tool: permitted iff its server prefix is listed.
        if let Some((server, _)) = tool_name.split_once('/') {
            return self.permitted.iter().any(|p| p == server);
        }
        // Spawn calls are governed by the spawnableAgents permission rule
        // (§4.2), not the generic tool allow-list — a spawnable short name
        // or the literal `spawn_agents` is always routable here; the actual
        // grant/deny decision happens in `SpawnRouter::spawn`.
        if tool_name == "spawn_agents" || self.spawnable_short_names.contains_key(tool_name) {
            return true;
        }
        false
    }

    fn route(&self, tool_name: &str) -> Option<Route> {
        if tool_name == "spawn_agents" || self.spawnable_short_names.contains_key(tool_name) {
            return Some(Route::SpawnAgents);
        }
        if let Some(tool) = self.native_tools.get(tool_name) {
            return Some(Route::Native(tool.clone()));
        }
        if let Some((server, remote_name)) = tool_name.split_once('/') {
            return Some(Route::Remote {
                server: server.to_string(),
                tool_name: remote_name.to_string(),
            });
        }
        None
    }

    /// Validate and execute one call. Emits `tool_result` on `sink` when
    /// the call actually runs (an orphan/unpermitted call emits only
    /// `error` and no `tool_result`, per the protocol contract).
    pub async fn dispatch(
        &mut self,
        call: &ToolCallRequest,
        sink: ResponseSink<'_>,
    ) -> Result<Vec<ContentPart>, RuntimeError> {
        if !self.is_permitted(&call.tool_name) {
            let err = RuntimeError::ToolNotPermitted {
                tool_name: call.tool_name.clone(),
                agent_type: self.agent_type_label.clone(),
            };
            emit_safely(sink, ResponseEvent::Error(err.to_string()));
            return Err(err);
        }

        let Some(route) = self.route(&call.tool_name) else {
            let err = RuntimeError::ToolNotPermitted {
                tool_name: call.tool_name.clone(),
                agent_type: self.agent_type_label.clone(),
            };
            emit_safely(sink, ResponseEvent::Error(err.to_string()));
            return Err(err);
        };

        if let Some(guard) = &self.loop_guard {
            if !guard.allow(&call.tool_name, &call.input) {
                let err = RuntimeError::ToolValidationFailed {
                    tool_name: call.tool_name.clone(),
                    message: "blocked by the loop guard: repeated call with no progress".to_string(),
                };
                emit_safely(sink, ResponseEvent::Error(err.to_string()));
                return Err(err);
            }
        }

        let mut hook_ctx = ToolCallHookContext::new(call.tool_name.clone());
        if let Value::Object(map) = &call.input {
            hook_ctx.tool_input = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        if !run_before_tool_call_hooks(&mut hook_ctx) {
            let err = RuntimeError::ToolValidationFailed {
                tool_name: call.tool_name.clone(),
                message: "blocked by a before_tool_call hook".to_string(),
            };
            emit_safely(sink, ResponseEvent::Error(err.to_string()));
            return Err(err);
        }

        let result = match route {
            Route::Native(tool) => {
                if let Err(message) = validate_against_schema(tool.input_schema(), &call.input) {
                    let err = RuntimeError::ToolValidationFailed {
                        tool_name: call.tool_name.clone(),
                        message,
                    };
                    emit_safely(sink, ResponseEvent::Error(err.to_string()));
                    return Err(err);
                }
                tool.call(call.input.clone()).await.map_err(|source| {
                    RuntimeError::ToolExecutionFailed {
                        tool_name: call.tool_name.clone(),
                        source,
                    }
                })
            }
            Route::Remote { server, tool_name } => match &self.remote_executor {
                Some(executor) => executor
                    .call(&server, &tool_name, call.input.clone())
                    .await
                    .map_err(|source| RuntimeError::ToolExecutionFailed {
                        tool_name: call.tool_name.clone(),
                        source,
                    }),
                None => Err(RuntimeError::ToolExecutionFailed {
                    tool_name: call.tool_name.clone(),
                    source: "no remote tool executor configured".into(),
                }),
            },
            Route::SpawnAgents => match &self.spawn_router {
                Some(router) => router.spawn(call, sink).await,
                None => Err(RuntimeError::ToolValidationFailed {
                    tool_name: call.tool_name.clone(),
                    message: "no spawn router configured for this dispatcher".to_string(),
                }),
            },
        };

        match result {
            Ok(parts) => {
                let parts = match self.max_output_chars {
                    Some(max_chars) => truncate_parts(parts, max_chars),
                    None => parts,
                };
                let mut hook_ctx_after = hook_ctx;
                let as_text = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                hook_ctx_after.tool_result = Some(as_text.clone());
                run_after_tool_call_hooks(&mut hook_ctx_after);

                emit_safely(
                    sink,
                    ResponseEvent::ToolResult {
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        output: Value::String(
                            hook_ctx_after.tool_result.unwrap_or(as_text),
                        ),
                    },
                );
                Ok(parts)
            }
            Err(err) => {
                emit_safely(sink, ResponseEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }
}

/// Truncates any `Text` part over `max_chars`, keeping a head and tail slice
/// and replacing the middle with an "N chars omitted" marker. Non-text parts
/// and text under the ceiling pass through untouched.
fn truncate_parts(parts: Vec<ContentPart>, max_chars: usize) -> Vec<ContentPart> {
    parts
        .into_iter()
        .map(|part| match part {
            ContentPart::Text { text } if text.len() > max_chars => {
                let half = max_chars / 2;
                let head: String = text.chars().take(half).collect();
                let tail: String = text
                    .chars()
                    .rev()
                    .take(max_chars - half)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let omitted = text.len() - head.len() - tail.len();
                ContentPart::Text {
                    text: format!("{head}\n[{omitted} chars omitted]\n{tail}"),
                }
            }
            other => other,
        })
        .collect()
}

/// Minimal JSON-Schema-shaped validation: presently checks only that
/// required properties are present, matching the depth of validation the
/// teacher's `BaseTool::args_schema` path performs before a call is run.
fn validate_against_schema(schema: &Value, input: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let Some(obj) = input.as_object() else {
        if required.is_empty() {
            return Ok(());
        }
        return Err("expected a JSON object".to_string());
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        if !obj.contains_key(key) {
            return Err(format!("missing required field '{key}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        schema: Value,
    }

    #[async_trait]
    impl NativeTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn input_schema(&self) -> &Value {
            &self.schema
        }
        async fn call(&self, input: Value) -> Result<Vec<ContentPart>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(vec![ContentPart::Text {
                text: input.to_string(),
            }])
        }
    }

    fn noop_sink(_: ResponseEvent) {}

    #[tokio::test]
    async fn unpermitted_tool_is_rejected_without_tool_result() {
        let mut dispatcher = ToolDispatcher::new("researcher");
        dispatcher.register_native(Arc::new(EchoTool {
            schema: serde_json::json!({}),
        }));
        // deliberately not added to permitted
        let call = ToolCallRequest {
            tool_call_id: "1".into(),
            tool_name: "echo".into(),
            input: Value::Null,
        };
        let result = dispatcher.dispatch(&call, &noop_sink).await;
        assert!(matches!(result, Err(RuntimeError::ToolNotPermitted { .. })));
    }

    #[tokio::test]
    async fn permitted_native_tool_executes() {
        let mut dispatcher = ToolDispatcher::new("researcher");
        dispatcher.register_native(Arc::new(EchoTool {
            schema: serde_json::json!({}),
        }));
        dispatcher.set_permitted_tools(vec!["echo".to_string()]);
        let call = ToolCallRequest {
            tool_call_id: "1".into(),
            tool_name: "echo".into(),
            input: serde_json::json!({"q": "hi"}),
        };
        let result = dispatcher.dispatch(&call, &noop_sink).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn schema_validation_failure_is_not_executed() {
        let mut dispatcher = ToolDispatcher::new("researcher");
        dispatcher.register_native(Arc::new(EchoTool {
            schema: serde_json::json!({"required": ["q"]}),
        }));
        dispatcher.set_permitted_tools(vec!["echo".to_string()]);
        let call = ToolCallRequest {
            tool_call_id: "1".into(),
            tool_name: "echo".into(),
            input: serde_json::json!({}),
        };
        let result = dispatcher.dispatch(&call, &noop_sink).await;
        assert!(matches!(
            result,
            Err(RuntimeError::ToolValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn remote_tool_routes_by_namespace_prefix() {
        struct FakeRemote;
        #[async_trait]
        impl RemoteToolExecutor for FakeRemote {
            async fn call(
                &self,
                _server: &str,
                _tool_name: &str,
                _input: Value,
            ) -> Result<Vec<ContentPart>, Box<dyn std::error::Error + Send + Sync>> {
                Ok(vec![ContentPart::Text {
                    text: "ok".to_string(),
                }])
            }
        }
        let mut dispatcher = ToolDispatcher::new("researcher");
        dispatcher.set_remote_executor(Arc::new(FakeRemote));
        dispatcher.set_permitted_tools(vec!["myserver".to_string()]);
        let call = ToolCallRequest {
            tool_call_id: "1".into(),
            tool_name: "myserver/search".into(),
            input: Value::Null,
        };
        let result = dispatcher.dispatch(&call, &noop_sink).await;
        assert!(result.is_ok());
    }
}
