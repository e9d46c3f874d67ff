//! Host notifications.
//!
//! The host application broadcasts typed notifications about session
//! activity; the telemetry integration subscribes and derives collector
//! calls from them. Payloads are tagged unions so consumers match
//! exhaustively instead of probing dynamic JSON.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
/// Slow subscribers beyond this capacity miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

/// Token usage reported with an assistant message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A part-level update within an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessagePart {
    /// A tool call finished, successfully or not.
    ToolCall {
        name: String,
        #[serde(default)]
        is_error: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },

    /// The assistant finished a reasoning/tool step.
    StepFinish,
}

/// Notifications emitted by the host about session activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostEvent {
    /// A new interactive session was created.
    SessionCreated {
        session_id: String,
        user_id: String,
        org_id: String,
    },

    /// The session was deleted by the user.
    SessionDeleted { session_id: String },

    /// The session hit an error.
    SessionError {
        session_id: String,
        error_kind: String,
    },

    /// A message finished updating.
    MessageUpdated {
        role: MessageRole,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default)]
        has_images: bool,
        #[serde(default)]
        has_files: bool,
    },

    /// A part of the in-flight assistant message updated.
    MessagePartUpdated { part: MessagePart },

    /// A file was edited by the agent.
    FileEdited {
        path: String,
        lines_added: u32,
        lines_removed: u32,
    },

    /// Context compaction completed.
    CompactionCompleted,

    /// The user retried the current exchange.
    TurnRetried,
}

/// Broadcast bus for [`HostEvent`]s.
///
/// Multiple consumers receive the same events concurrently; subscribers
/// that join late do not see past events.
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Returns how many received it;
    /// with no subscribers the event is dropped and 0 is returned.
    pub fn emit(&self, event: HostEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
