//! The external response sink: the one ordered channel of events a host
//! observes while a run executes.
//!
//! Grounded on `crewai::events::event_bus`: that module's dependency-graph
//! dispatch is overkill for a single linear event stream, but its idea of
//! "one registered handler set, invoked in order, with panics caught so a
//! bad handler can't wedge the run" is kept here in miniature.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event delivered to the host via `onResponseChunk`.
///
/// Ordering guarantees (enforced by the stream processor and agent loop,
/// not by this type): `ToolCall(id)` always precedes `ToolResult(id)`;
/// `SubagentStart` always precedes every event from that child, which all
/// precede the matching `SubagentFinish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: Value,
    },
    SubagentStart {
        run_id: String,
        agent_type: String,
    },
    SubagentFinish {
        run_id: String,
    },
    Error(String),
}

/// A sink is just a callback; boxed so the agent loop can thread one
/// through recursive child invocations without generics spreading
/// everywhere.
pub type ResponseSink<'a> = &'a dyn Fn(ResponseEvent);

/// Invoke `sink`, swallowing (and logging) a panic inside the callback so
/// one broken host integration can't abort an entire run — the same
/// protection the teacher's event bus applies around handler dispatch.
pub fn emit_safely(sink: ResponseSink<'_>, event: ResponseEvent) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(event)));
    if result.is_err() {
        log::error!("response sink panicked while handling an event");
    }
}
