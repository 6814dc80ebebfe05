//! # Agent Runtime
//!
//! A library driving end-to-end execution of hierarchical LLM-backed
//! agents: streaming LLM turns, sequential in-turn tool dispatch, a
//! token-aware message store, and recursive agent spawning with credit
//! rollup. See `runtime` for the core; `hooks` is the one piece of ambient
//! scaffolding it calls into. The LLM transport, concrete tool
//! implementations, durable storage, and MCP servers are all host-supplied
//! collaborators reached through the trait contracts in
//! `runtime::contracts` — this crate never implements them itself.

pub mod hooks;
pub mod runtime;

pub use runtime::{
    AgentLoop, AgentOutput, AgentState, AgentTemplate, AgentTemplateRef, Message, MessageStore,
    MessageTtl, ResponseEvent, Run, RunStatus, RuntimeConfig, RuntimeError,
};
