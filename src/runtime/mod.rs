//! The agent runtime: message store, tool dispatcher, stream processor,
//! step executor, and agent loop.
//!
//! See the crate-level `SPEC_FULL.md` in the repository root for the full
//! design; this module tree is the implementation of its components §4.1–§4.5.

pub mod agent_loop;
pub mod config;
pub mod contracts;
pub mod dispatcher;
pub mod errors;
pub mod message;
pub mod sink;
pub mod step;
pub mod stream;
pub mod template;

pub use agent_loop::{AgentLoop, CancellationToken, InvokeRequest, RuntimeServices};
pub use config::RuntimeConfig;
pub use errors::RuntimeError;
pub use message::{Message, MessageStore, MessageTtl};
pub use sink::ResponseEvent;
pub use template::{AgentOutput, AgentState, AgentTemplate, AgentTemplateRef, Run, RunStatus};
