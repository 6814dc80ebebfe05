//! Tunables for the agent runtime.
//!
//! Generalizes `crewai::utilities::config::process_config` from a one-shot
//! defaults/overrides merge into a small typed settings struct, since the
//! runtime's tunables (truncation factor, depth bound, step budgets) are
//! known ahead of time rather than arbitrary JSON.

/// Runtime-wide tunables. Constructed once per host process and shared
/// (read-only) across runs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Fraction of the token headroom below `max` that a truncation pass
    /// targets, reserving room for the turns still to come.
    pub shortened_token_factor: f64,
    /// Number of most-recent `run_terminal_command` outputs kept in full
    /// before earlier ones are replaced by a summary.
    pub terminal_output_keep_count: usize,
    /// Character ceiling above which any single tool output is truncated
    /// with a head/tail + "N chars omitted" marker.
    pub tool_output_truncate_chars: usize,
    /// Maximum recursion depth for `spawn_agents` (root = depth 0).
    pub max_agent_depth: usize,
    /// Default `stepsRemaining` budget given to a freshly spawned child.
    pub default_child_steps: u32,
    /// Whether `userPrompt`-TTL messages are expired once the run completes.
    pub clear_user_prompt_messages_after_response: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shortened_token_factor: 0.8,
            terminal_output_keep_count: 5,
            tool_output_truncate_chars: 20_000,
            max_agent_depth: 10,
            default_child_steps: 25,
            clear_user_prompt_messages_after_response: true,
        }
    }
}

impl RuntimeConfig {
    /// Start from defaults and apply `overrides` (any field left `None` in
    /// an overrides struct keeps the default). Mirrors the
    /// defaults-then-overrides merge shape of `process_config`, adapted to
    /// a typed struct instead of an untyped map.
    pub fn with_overrides(overrides: RuntimeConfigOverrides) -> Self {
        let defaults = Self::default();
        Self {
            shortened_token_factor: overrides
                .shortened_token_factor
                .unwrap_or(defaults.shortened_token_factor),
            terminal_output_keep_count: overrides
                .terminal_output_keep_count
                .unwrap_or(defaults.terminal_output_keep_count),
            tool_output_truncate_chars: overrides
                .tool_output_truncate_chars
                .unwrap_or(defaults.tool_output_truncate_chars),
            max_agent_depth: overrides.max_agent_depth.unwrap_or(defaults.max_agent_depth),
            default_child_steps: overrides
                .default_child_steps
                .unwrap_or(defaults.default_child_steps),
            clear_user_prompt_messages_after_response: overrides
                .clear_user_prompt_messages_after_response
                .unwrap_or(defaults.clear_user_prompt_messages_after_response),
        }
    }
}

/// Sparse override set for [`RuntimeConfig::with_overrides`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigOverrides {
    pub shortened_token_factor: Option<f64>,
    pub terminal_output_keep_count: Option<usize>,
    pub tool_output_truncate_chars: Option<usize>,
    pub max_agent_depth: Option<usize>,
    pub default_child_steps: Option<u32>,
    pub clear_user_prompt_messages_after_response: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_agent_depth, 10);
        assert_eq!(cfg.terminal_output_keep_count, 5);
    }

    #[test]
    fn overrides_apply_selectively() {
        let cfg = RuntimeConfig::with_overrides(RuntimeConfigOverrides {
            max_agent_depth: Some(3),
            ..Default::default()
        });
        assert_eq!(cfg.max_agent_depth, 3);
        assert_eq!(cfg.terminal_output_keep_count, 5);
    }
}
