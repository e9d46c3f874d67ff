//! # pulse-core
//!
//! Client-side telemetry pipeline for Pulse, the AI coding agent CLI.
//!
//! The pipeline observes session activity (turns, tool calls, file edits,
//! compactions), derives privacy-safe aggregates and implicit quality
//! signals, and ships them to the collection service under explicit consent
//! rules. It is framework-agnostic: the host hands it a settings object and
//! a stream of typed notifications, nothing more.
//!
//! ## Key Concepts
//!
//! - **Session**: one interactive run of the agent
//! - **Turn**: a user message and the assistant's complete response
//! - **Signal**: implicit, behavior-derived indicator of session quality
//! - **Consent**: resolved policy deciding whether and at what fidelity
//!   telemetry is collected
//!
//! Telemetry must never disturb the host: recording calls are synchronous,
//! non-blocking, and swallow every internal failure.

pub mod collector;
pub mod config;
pub mod consent;
pub mod events;
pub mod integration;
pub mod sanitize;
pub mod session;
pub mod signals;
pub mod transport;
pub mod uploader;

// Re-export commonly used types
pub use collector::TelemetryCollector;
pub use config::TelemetryConfig;
pub use consent::{ConsentResolver, ConsentStatus};
pub use events::{EventBus, HostEvent};
pub use integration::{attach, Subscription};
pub use session::{DataLevel, SessionRecord, Tier, TurnRecord};
