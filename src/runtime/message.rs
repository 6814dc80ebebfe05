//! Conversation history with TTL expiration and token-bounded truncation.
//!
//! The shape (role-tagged messages, a `save`/`search` style store) is
//! grounded on `crewai::memory::short_term::ShortTermMemory`, but this
//! store is not a retrieval index: it owns the exact ordered transcript
//! the LLM transport sees, plus the invariants in the data model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// TTL class for a message. Absent (`None` on [`Message::ttl`]) means the
/// message never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTtl {
    /// Expires at the end of the agent step that produced it, and also at
    /// the next user-prompt boundary.
    AgentStep,
    /// Expires only at the next user-prompt boundary.
    UserPrompt,
}

/// Boundary at which [`MessageStore::expire`] is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireBoundary {
    EndOfAgentStep,
    EndOfUserPrompt,
}

impl MessageTtl {
    fn expires_at(self, boundary: ExpireBoundary) -> bool {
        match self {
            MessageTtl::AgentStep => true, // expires at both boundaries
            MessageTtl::UserPrompt => matches!(boundary, ExpireBoundary::EndOfUserPrompt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Plain(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    fn is_empty(&self) -> bool {
        match self {
            MessageContent::Plain(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            MessageContent::Plain(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    fn without_tool_call(&self, id: &str) -> MessageContent {
        match self {
            MessageContent::Plain(s) => MessageContent::Plain(s.clone()),
            MessageContent::Parts(parts) => MessageContent::Parts(
                parts
                    .iter()
                    .filter(|p| !matches!(p, ContentPart::ToolCall { tool_call_id, .. } if tool_call_id == id))
                    .cloned()
                    .collect(),
            ),
        }
    }

    /// Rough token estimate: ~4 characters per token, the same ballpark
    /// fallback the teacher's LLM layer uses when an exact tokenizer call
    /// fails.
    fn estimate_tokens(&self) -> u64 {
        let char_count = match self {
            MessageContent::Plain(s) => s.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { url } => url.len(),
                    ContentPart::ToolCall { input, .. } => input.to_string().len(),
                })
                .sum(),
        };
        (char_count as u64 / 4).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub tags: Vec<String>,
    pub ttl: Option<MessageTtl>,
    pub keep_during_truncation: bool,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    /// Provider-specific cache-control metadata, opaque to the runtime.
    /// Cleared by truncation so the LLM layer can re-apply it.
    pub cache_control: Option<Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tags: Vec::new(),
            ttl: None,
            keep_during_truncation: false,
            tool_call_id: None,
            tool_name: None,
            cache_control: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_ttl(mut self, ttl: MessageTtl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn keep(mut self) -> Self {
        self.keep_during_truncation = true;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Plain(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Plain(s.to_string())
    }
}

/// The conversation transcript for one agent instance.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

const OMITTED_MARKER: &str = "[previous messages omitted]";

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_inner(self) -> Vec<Message> {
        self.messages
    }

    /// Replace the whole transcript with a single message (used by the
    /// `/compact` command).
    pub fn replace_all(&mut self, message: Message) {
        self.messages = vec![message];
    }

    /// Remove messages whose TTL matches `boundary` per [`MessageTtl::expires_at`].
    /// Idempotent: running twice in a row at the same boundary is a no-op
    /// the second time.
    pub fn expire(&mut self, boundary: ExpireBoundary) {
        self.messages
            .retain(|m| !matches!(m.ttl, Some(ttl) if ttl.expires_at(boundary)));
    }

    /// Return a filtered copy of the history suitable for handing to a
    /// spawned child: any assistant tool-call part without a matching
    /// tool-result message is dropped, and any assistant message left
    /// empty by that filtering is dropped entirely.
    pub fn filter_unfinished_tool_calls(&self) -> Vec<Message> {
        let finished_ids: std::collections::HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        let mut out = Vec::with_capacity(self.messages.len());
        for m in &self.messages {
            if m.role != Role::Assistant {
                out.push(m.clone());
                continue;
            }
            let mut content = m.content.clone();
            for id in m.content.tool_call_ids() {
                if !finished_ids.contains(id) {
                    content = content.without_tool_call(id);
                }
            }
            if content.is_empty() && !matches!(m.content, MessageContent::Plain(_)) {
                continue;
            }
            let mut filtered = m.clone();
            filtered.content = content;
            out.push(filtered);
        }
        out
    }

    /// Token-bounded truncation. `system_tokens` is the fixed cost of the
    /// system prompt; `max` is the hard ceiling. Returns without mutating
    /// anything if the history already fits (fixed point).
    ///
    /// Algorithm: first simplify older `run_terminal_command` outputs
    /// beyond the `keep_count` newest, then drop the oldest non-kept
    /// contiguous run of messages (replacing it with one placeholder)
    /// until the remainder fits inside
    /// `shortened_token_factor * (max - system_tokens - required) + required`,
    /// where `required` is the token cost of every `keep_during_truncation`
    /// message.
    pub fn trim_to_token_budget(
        &mut self,
        system_tokens: u64,
        max: u64,
        shortened_token_factor: f64,
        terminal_output_keep_count: usize,
    ) {
        self.simplify_old_terminal_outputs(terminal_output_keep_count);

        let required: u64 = self
            .messages
            .iter()
            .filter(|m| m.keep_during_truncation)
            .map(|m| m.content.estimate_tokens())
            .sum();

        let history_tokens: u64 = self.messages.iter().map(|m| m.content.estimate_tokens()).sum();

        if system_tokens + history_tokens <= max {
            return; // fixed point: nothing to do
        }

        let headroom = (max as f64 - system_tokens as f64 - required as f64).max(0.0);
        let target = (shortened_token_factor * headroom + required as f64) as u64;

        // Walk oldest-to-newest, dropping non-kept messages into one
        // contiguous run at a time until the remainder fits `target`,
        // never letting two placeholders end up adjacent (a later drop
        // extends the existing placeholder's range instead of inserting
        // a second one).
        let mut kept: Vec<Message> = Vec::with_capacity(self.messages.len());
        let mut running_total = 0u64;
        let mut pending_drop = false;

        // Compute running total from the back (newest) so we keep the
        // newest messages and drop the oldest first.
        let mut suffix_tokens = vec![0u64; self.messages.len() + 1];
        for (i, m) in self.messages.iter().enumerate().rev() {
            suffix_tokens[i] = suffix_tokens[i + 1] + m.content.estimate_tokens();
        }

        for (i, m) in self.messages.iter().enumerate() {
            let would_keep_from_here = suffix_tokens[i];
            let drop_this =
                !m.keep_during_truncation && running_total + would_keep_from_here > target;

            if drop_this {
                pending_drop = true;
                continue;
            }

            if pending_drop {
                kept.push(placeholder_message());
                pending_drop = false;
            }
            running_total += m.content.estimate_tokens();
            kept.push(m.clone());
        }
        if pending_drop {
            kept.push(placeholder_message());
        }

        for m in &mut kept {
            m.cache_control = None;
        }

        self.messages = kept;
    }

    fn simplify_old_terminal_outputs(&mut self, keep_count: usize) {
        let indices: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool && m.tool_name.as_deref() == Some("run_terminal_command"))
            .map(|(i, _)| i)
            .collect();

        if indices.len() <= keep_count {
            return;
        }
        let to_simplify = &indices[..indices.len() - keep_count];
        for &i in to_simplify {
            self.messages[i].content =
                MessageContent::Plain("[earlier terminal output omitted]".to_string());
        }
    }
}

fn placeholder_message() -> Message {
    Message::new(Role::User, OMITTED_MARKER).with_tag("truncation_placeholder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call_msg(id: &str) -> Message {
        Message::new(
            Role::Assistant,
            MessageContent::Parts(vec![ContentPart::ToolCall {
                tool_call_id: id.to_string(),
                tool_name: "search".to_string(),
                input: Value::Null,
            }]),
        )
    }

    fn tool_result_msg(id: &str) -> Message {
        let mut m = Message::new(Role::Tool, "result");
        m.tool_call_id = Some(id.to_string());
        m
    }

    #[test]
    fn expire_agent_step_at_both_boundaries() {
        let mut store = MessageStore::new();
        store.append(Message::new(Role::User, "x").with_ttl(MessageTtl::AgentStep));
        store.expire(ExpireBoundary::EndOfAgentStep);
        assert!(store.is_empty());

        let mut store2 = MessageStore::new();
        store2.append(Message::new(Role::User, "x").with_ttl(MessageTtl::AgentStep));
        store2.expire(ExpireBoundary::EndOfUserPrompt);
        assert!(store2.is_empty());
    }

    #[test]
    fn user_prompt_ttl_only_expires_at_user_prompt_boundary() {
        let mut store = MessageStore::new();
        store.append(Message::new(Role::User, "x").with_ttl(MessageTtl::UserPrompt));
        store.expire(ExpireBoundary::EndOfAgentStep);
        assert_eq!(store.len(), 1);
        store.expire(ExpireBoundary::EndOfUserPrompt);
        assert!(store.is_empty());
    }

    #[test]
    fn expire_is_idempotent() {
        let mut store = MessageStore::new();
        store.append(Message::new(Role::User, "x").with_ttl(MessageTtl::AgentStep));
        store.append(Message::new(Role::User, "y"));
        store.expire(ExpireBoundary::EndOfAgentStep);
        let after_first = store.as_slice().to_vec();
        store.expire(ExpireBoundary::EndOfAgentStep);
        assert_eq!(store.as_slice(), after_first.as_slice());
    }

    #[test]
    fn filter_unfinished_tool_calls_drops_orphans() {
        let mut store = MessageStore::new();
        store.append(tool_call_msg("a"));
        store.append(tool_result_msg("a"));
        store.append(tool_call_msg("b")); // no matching result
        let filtered = store.filter_unfinished_tool_calls();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn trim_is_fixed_point_when_already_fits() {
        let mut store = MessageStore::new();
        store.append(Message::new(Role::User, "short"));
        let before = store.as_slice().to_vec();
        store.trim_to_token_budget(10, 100_000, 0.8, 5);
        assert_eq!(store.as_slice(), before.as_slice());
    }

    #[test]
    fn trim_never_clusters_placeholders() {
        let mut store = MessageStore::new();
        for i in 0..50 {
            store.append(Message::new(Role::User, "x".repeat(200)).with_tag(format!("m{i}")));
        }
        store.trim_to_token_budget(0, 500, 0.5, 5);
        let placeholders = store
            .as_slice()
            .windows(2)
            .filter(|w| {
                w[0].has_tag("truncation_placeholder") && w[1].has_tag("truncation_placeholder")
            })
            .count();
        assert_eq!(placeholders, 0);
    }

    #[test]
    fn trim_keeps_keep_during_truncation_messages() {
        let mut store = MessageStore::new();
        store.append(Message::new(Role::User, "x".repeat(5000)).keep());
        for _ in 0..20 {
            store.append(Message::new(Role::User, "y".repeat(500)));
        }
        store.trim_to_token_budget(0, 400, 0.5, 5);
        assert!(store.as_slice().iter().any(|m| m.keep_during_truncation));
    }
}
