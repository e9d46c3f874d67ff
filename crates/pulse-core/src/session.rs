//! Telemetry data model.
//!
//! These are the wire types shipped to the collection service. Everything
//! here serializes as camelCase JSON. Content fields are always sanitized
//! before they reach these records and are omitted entirely at the
//! `metrics-only` data level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where the agent process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Environment {
    Local,
    Hosted,
}

impl Environment {
    /// Classify the current process environment.
    ///
    /// Hosted means a CI runner, codespace, devcontainer or remote shell;
    /// everything else is a local interactive run.
    pub fn detect() -> Self {
        const HOSTED_VARS: [&str; 4] = ["CI", "CODESPACES", "REMOTE_CONTAINERS", "SSH_CONNECTION"];
        if HOSTED_VARS.iter().any(|v| std::env::var_os(v).is_some()) {
            Self::Hosted
        } else {
            Self::Local
        }
    }
}

/// Account-level classification controlling default telemetry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    Free,
    Standard,
    Pro,
}

impl Tier {
    /// Parse a tier string from the consent service.
    ///
    /// Unknown tiers map to `Standard` so a new server-side tier never
    /// breaks resolution on old clients.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "standard" => Self::Standard,
            "pro" => Self::Pro,
            other => {
                log::debug!("Unknown consent tier '{}', treating as standard", other);
                Self::Standard
            }
        }
    }
}

/// Fidelity of collected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataLevel {
    /// Sanitized message content is included.
    Full,
    /// Only lengths, counts and token totals are included.
    MetricsOnly,
}

/// Cumulative per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetrics {
    pub turn_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// Usage attributed to a single model within a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelUsage {
    pub turns: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Final session state derived from the signal tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinalState {
    Completed,
    Abandoned,
    Error,
}

/// Implicit, behavior-derived indicators of session quality.
///
/// Computed once at session end; never updated incrementally on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSignals {
    pub retry_count: u32,
    pub compaction_count: u32,
    pub abandoned_mid_turn: bool,
    pub final_state: FinalState,
    /// Distinct error kinds observed, sorted and deduplicated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_kinds: Vec<String>,
}

/// One interactive run of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session identifier assigned by the host.
    pub id: String,

    /// Owning user.
    pub user_id: String,

    /// Owning organization.
    pub org_id: String,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    pub environment: Environment,

    /// Consent tier in effect when the session started.
    pub tier: Tier,

    /// Data level in effect when the session started.
    pub data_level: DataLevel,

    pub metrics: SessionMetrics,

    /// Per-model usage breakdown, keyed by model id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_usage: HashMap<String, ModelUsage>,

    /// Set once at session end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<SessionSignals>,
}

impl SessionRecord {
    pub fn new(
        id: String,
        user_id: String,
        org_id: String,
        environment: Environment,
        tier: Tier,
        data_level: DataLevel,
    ) -> Self {
        Self {
            id,
            user_id,
            org_id,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            environment,
            tier,
            data_level,
            metrics: SessionMetrics::default(),
            model_usage: HashMap::new(),
            signals: None,
        }
    }
}

/// Partial session fields sent with `PATCH /api/v1/sessions/{id}` at
/// session end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SessionMetrics>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_usage: HashMap<String, ModelUsage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<SessionSignals>,
}

/// Sanitized user-message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageRecord {
    /// Redacted and truncated content. Omitted at `metrics-only`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Character length of the original message, pre-redaction.
    pub length: usize,

    #[serde(default)]
    pub has_images: bool,

    #[serde(default)]
    pub has_files: bool,
}

/// Sanitized assistant-message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessageRecord {
    /// Redacted and truncated content. Omitted at `metrics-only`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Character length of the original message, pre-redaction.
    pub length: usize,

    pub model: String,

    pub input_tokens: u64,

    pub output_tokens: u64,

    pub latency_ms: u64,
}

/// Outcome of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One tool invocation within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,

    pub status: ToolStatus,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// One file edit within a turn.
///
/// Paths are never transmitted in clear; only a digest and the extension
/// survive sanitization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeRecord {
    pub path_hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,

    pub lines_added: u32,

    pub lines_removed: u32,
}

/// One user-message/assistant-response exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    /// Zero-based, monotonic per session.
    pub turn_index: u32,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<UserMessageRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<AssistantMessageRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_changes: Vec<FileChangeRecord>,

    #[serde(default)]
    pub retried: bool,
}

impl TurnRecord {
    pub fn new(turn_index: u32) -> Self {
        Self {
            turn_index,
            started_at: Utc::now(),
            user_message: None,
            assistant_message: None,
            tool_calls: Vec::new(),
            file_changes: Vec::new(),
            retried: false,
        }
    }

    /// A turn may only be uploaded once both sides of the exchange exist.
    pub fn is_complete(&self) -> bool {
        self.user_message.is_some() && self.assistant_message.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tier {
        use super::*;

        #[test]
        fn parses_known_tiers() {
            assert_eq!(Tier::parse("free"), Tier::Free);
            assert_eq!(Tier::parse("standard"), Tier::Standard);
            assert_eq!(Tier::parse("pro"), Tier::Pro);
        }

        #[test]
        fn parse_is_case_insensitive() {
            assert_eq!(Tier::parse("Free"), Tier::Free);
            assert_eq!(Tier::parse("PRO"), Tier::Pro);
        }

        #[test]
        fn unknown_tier_maps_to_standard() {
            assert_eq!(Tier::parse("enterprise"), Tier::Standard);
            assert_eq!(Tier::parse(""), Tier::Standard);
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(serde_json::to_string(&Tier::Free).unwrap(), "\"free\"");
            assert_eq!(serde_json::to_string(&Tier::Pro).unwrap(), "\"pro\"");
        }
    }

    mod data_level {
        use super::*;

        #[test]
        fn serializes_kebab_case() {
            assert_eq!(serde_json::to_string(&DataLevel::Full).unwrap(), "\"full\"");
            assert_eq!(
                serde_json::to_string(&DataLevel::MetricsOnly).unwrap(),
                "\"metrics-only\""
            );
        }

        #[test]
        fn deserializes_from_wire() {
            let level: DataLevel = serde_json::from_str("\"metrics-only\"").unwrap();
            assert_eq!(level, DataLevel::MetricsOnly);
        }
    }

    mod turn_record {
        use super::*;

        fn user_message() -> UserMessageRecord {
            UserMessageRecord {
                content: Some("fix bug".to_string()),
                length: 7,
                has_images: false,
                has_files: false,
            }
        }

        fn assistant_message() -> AssistantMessageRecord {
            AssistantMessageRecord {
                content: Some("done".to_string()),
                length: 4,
                model: "m1".to_string(),
                input_tokens: 50,
                output_tokens: 20,
                latency_ms: 800,
            }
        }

        #[test]
        fn new_turn_is_incomplete() {
            let turn = TurnRecord::new(0);
            assert!(!turn.is_complete());
            assert_eq!(turn.turn_index, 0);
            assert!(!turn.retried);
        }

        #[test]
        fn complete_requires_both_messages() {
            let mut turn = TurnRecord::new(0);
            turn.user_message = Some(user_message());
            assert!(!turn.is_complete());

            turn.assistant_message = Some(assistant_message());
            assert!(turn.is_complete());
        }

        #[test]
        fn assistant_only_is_incomplete() {
            let mut turn = TurnRecord::new(3);
            turn.assistant_message = Some(assistant_message());
            assert!(!turn.is_complete());
        }

        #[test]
        fn serializes_camel_case_and_skips_empty() {
            let mut turn = TurnRecord::new(1);
            turn.user_message = Some(user_message());

            let json = serde_json::to_string(&turn).unwrap();
            assert!(json.contains("\"turnIndex\":1"));
            assert!(json.contains("\"userMessage\""));
            assert!(!json.contains("assistantMessage"));
            assert!(!json.contains("toolCalls"));
            assert!(!json.contains("fileChanges"));
        }

        #[test]
        fn roundtrip_with_tool_calls() {
            let mut turn = TurnRecord::new(2);
            turn.user_message = Some(user_message());
            turn.assistant_message = Some(assistant_message());
            turn.tool_calls.push(ToolCallRecord {
                name: "grep".to_string(),
                status: ToolStatus::Success,
                duration_ms: 120,
                error_kind: None,
            });

            let json = serde_json::to_string(&turn).unwrap();
            let parsed: TurnRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.turn_index, 2);
            assert_eq!(parsed.tool_calls.len(), 1);
            assert_eq!(parsed.tool_calls[0].name, "grep");
            assert!(parsed.is_complete());
        }
    }

    mod session_record {
        use super::*;

        #[test]
        fn new_initializes_zeroed_metrics() {
            let session = SessionRecord::new(
                "s1".to_string(),
                "u1".to_string(),
                "o1".to_string(),
                Environment::Local,
                Tier::Free,
                DataLevel::Full,
            );

            assert_eq!(session.metrics, SessionMetrics::default());
            assert!(session.model_usage.is_empty());
            assert!(session.ended_at.is_none());
            assert!(session.signals.is_none());
        }

        #[test]
        fn serializes_camel_case() {
            let session = SessionRecord::new(
                "s1".to_string(),
                "u1".to_string(),
                "o1".to_string(),
                Environment::Hosted,
                Tier::Pro,
                DataLevel::MetricsOnly,
            );

            let json = serde_json::to_string(&session).unwrap();
            assert!(json.contains("\"userId\":\"u1\""));
            assert!(json.contains("\"orgId\":\"o1\""));
            assert!(json.contains("\"environment\":\"hosted\""));
            assert!(json.contains("\"dataLevel\":\"metrics-only\""));
            assert!(!json.contains("endedAt"));
            assert!(!json.contains("signals"));
        }
    }

    mod session_update {
        use super::*;

        #[test]
        fn empty_update_serializes_to_empty_object() {
            let update = SessionUpdate::default();
            assert_eq!(serde_json::to_string(&update).unwrap(), "{}");
        }

        #[test]
        fn signals_serialize_with_final_state() {
            let update = SessionUpdate {
                signals: Some(SessionSignals {
                    retry_count: 1,
                    compaction_count: 0,
                    abandoned_mid_turn: false,
                    final_state: FinalState::Completed,
                    error_kinds: vec![],
                }),
                ..Default::default()
            };

            let json = serde_json::to_string(&update).unwrap();
            assert!(json.contains("\"finalState\":\"completed\""));
            assert!(!json.contains("errorKinds"));
        }
    }

    mod environment {
        use super::*;

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&Environment::Local).unwrap(),
                "\"local\""
            );
            assert_eq!(
                serde_json::to_string(&Environment::Hosted).unwrap(),
                "\"hosted\""
            );
        }
    }
}
