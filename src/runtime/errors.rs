//! Error types for the agent runtime.
//!
//! Corresponds to `crewai/utilities/errors.py` in spirit: one `thiserror`
//! enum per concern, with `#[from]` conversions at the boundary so call
//! sites can use `?` throughout.

use thiserror::Error;

/// Errors surfaced by the agent runtime's core loop and its components.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A tool call named a tool outside the agent's permitted set.
    #[error("tool '{tool_name}' is not permitted for agent type '{agent_type}'")]
    ToolNotPermitted {
        tool_name: String,
        agent_type: String,
    },

    /// A tool call's input failed schema validation.
    #[error("tool '{tool_name}' input validation failed: {message}")]
    ToolValidationFailed { tool_name: String, message: String },

    /// A tool handler returned an error.
    #[error("tool '{tool_name}' execution failed: {source}")]
    ToolExecutionFailed {
        tool_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `spawn_agents` targeted a template the parent may not spawn.
    #[error("agent type '{parent}' may not spawn '{child}'")]
    SpawnPermissionDenied { parent: String, child: String },

    /// A child agent's `prompt`/`params` failed the child template's input schema.
    #[error("spawn input validation failed for child '{child}': {message}")]
    SpawnValidationFailed { child: String, message: String },

    /// No template was found for the given agent type id.
    #[error("no agent template registered for '{0}'")]
    TemplateNotFound(String),

    /// A history invariant would have been violated by an operation.
    #[error("transcript invariant violated: {0}")]
    TranscriptInvariantViolation(String),

    /// The LLM transport, storage, or token-count contract failed.
    #[error("transport failure: {message}")]
    TransportFailure {
        message: String,
        status_code: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The run-lifecycle storage contract failed.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// A run's programmatic step handler was expected but not found in the
    /// generator registry (or has already been torn down).
    #[error("no active step handler for run '{0}'")]
    GeneratorNotFound(String),

    /// The run was cancelled by the caller.
    #[error("run cancelled by user")]
    Cancelled,
}

impl RuntimeError {
    /// HTTP status code carried by this error, if any.
    ///
    /// The agent loop rethrows (rather than converts to a failed-run
    /// output) exactly when this is `Some(402)`.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RuntimeError::TransportFailure { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// True when this error must propagate out of the agent loop instead of
    /// being converted into a failed-run output.
    pub fn is_payment_required(&self) -> bool {
        self.status_code() == Some(402)
    }
}
