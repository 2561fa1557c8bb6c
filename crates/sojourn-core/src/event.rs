use crate::StateMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Side effects an event asks the runtime to apply.
///
/// Only `state_delta` is interpreted by the session core; everything else is
/// carried through storage untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// Key → value changes to session, user, app or temp state.
    /// A `null` value deletes the key.
    #[serde(default)]
    pub state_delta: StateMap,
    /// Artifact name → version written during this event.
    #[serde(default)]
    pub artifact_delta: HashMap<String, i64>,
    /// Whether the tool response should not be summarized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_summarization: Option<bool>,
    /// Agent that control should be handed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Whether the agent escalates to its parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate: Option<bool>,
    /// Auth configs requested by tools, keyed by function call id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub requested_auth_configs: HashMap<String, serde_json::Value>,
}

/// A single turn record in a session's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id. Left empty, the store assigns one on append.
    pub id: String,
    /// Groups the events produced by one agent turn.
    pub invocation_id: String,
    /// `"user"` or the name of the agent that produced the event.
    pub author: String,
    /// Side effects, including the state delta.
    #[serde(default)]
    pub actions: EventActions,
    /// Agent hierarchy path, e.g. `root.child`.
    #[serde(default)]
    pub branch: Option<String>,
    /// When the event happened. Log order follows it.
    pub timestamp: DateTime<Utc>,
    /// Message content, opaque to the store.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    /// Grounding metadata from the model.
    #[serde(default)]
    pub grounding_metadata: Option<serde_json::Value>,
    /// Token usage reported by the model.
    #[serde(default)]
    pub usage_metadata: Option<serde_json::Value>,
    /// Citation metadata from the model.
    #[serde(default)]
    pub citation_metadata: Option<serde_json::Value>,
    /// Caller-defined metadata.
    #[serde(default)]
    pub custom_metadata: Option<serde_json::Value>,
    /// Ids of tool calls still running when the event was emitted.
    #[serde(default)]
    pub long_running_tool_ids: Vec<String>,
    /// Streaming fragment; partial events are never persisted.
    #[serde(default)]
    pub partial: Option<bool>,
    /// Set on the last event of a turn.
    #[serde(default)]
    pub turn_complete: Option<bool>,
    /// The turn was interrupted by the user.
    #[serde(default)]
    pub interrupted: Option<bool>,
    /// Model or tool error code.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable error description.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Event {
    /// Creates an event with a fresh id and the current timestamp.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            actions: EventActions::default(),
            branch: None,
            timestamp: Utc::now(),
            content: None,
            grounding_metadata: None,
            usage_metadata: None,
            citation_metadata: None,
            custom_metadata: None,
            long_running_tool_ids: Vec::new(),
            partial: None,
            turn_complete: None,
            interrupted: None,
            error_code: None,
            error_message: None,
        }
    }

    /// Replaces the state delta carried by this event.
    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.actions.state_delta = delta;
        self
    }

    /// Sets the opaque content payload.
    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = Some(content);
        self
    }

    /// Overrides the event timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// True for streaming fragments.
    pub fn is_partial(&self) -> bool {
        self.partial.unwrap_or(false)
    }
}
