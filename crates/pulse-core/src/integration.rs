//! Host integration.
//!
//! Thin glue between the host's notification bus and the collector: one
//! forwarding task per subscription, an exhaustive match over the event
//! union, and a cancellation handle the host invokes at shutdown.

use crate::collector::TelemetryCollector;
use crate::events::{EventBus, HostEvent, MessagePart, MessageRole};
use crate::session::ToolStatus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Handle to an active event subscription.
///
/// Cancelling (or dropping) the handle aborts the forwarding task
/// deterministically; no events are forwarded afterwards.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Subscribe the collector to the host's notifications.
///
/// Telemetry tolerates loss under backpressure: a lagged receiver logs a
/// warning and keeps going with the events that remain.
pub fn attach(bus: &EventBus, collector: Arc<TelemetryCollector>) -> Subscription {
    let mut rx = bus.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => forward(&collector, event).await,
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Telemetry lagged behind host events; {} dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    Subscription { handle }
}

async fn forward(collector: &TelemetryCollector, event: HostEvent) {
    match event {
        HostEvent::SessionCreated {
            session_id,
            user_id,
            org_id,
        } => collector.start_session(&session_id, &user_id, &org_id),

        HostEvent::SessionDeleted { session_id } => {
            log::debug!("Host deleted session [{}]", session_id);
            collector.end_session(true).await;
        }

        // Teardown comes separately; the error kind is what we keep.
        HostEvent::SessionError { error_kind, .. } => collector.record_error(&error_kind),

        HostEvent::MessageUpdated {
            role: MessageRole::User,
            content,
            has_images,
            has_files,
            ..
        } => collector.record_user_message(&content, has_images, has_files),

        HostEvent::MessageUpdated {
            role: MessageRole::Assistant,
            content,
            model,
            usage,
            latency_ms,
            cost_usd,
            ..
        } => {
            let usage = usage.unwrap_or_default();
            collector.record_assistant_message(
                &content,
                model.as_deref().unwrap_or("unknown"),
                usage.input_tokens,
                usage.output_tokens,
                latency_ms.unwrap_or(0),
                cost_usd,
            );
        }

        HostEvent::MessagePartUpdated {
            part:
                MessagePart::ToolCall {
                    name,
                    is_error,
                    duration_ms,
                    error_kind,
                },
        } => {
            let status = if is_error {
                ToolStatus::Error
            } else {
                ToolStatus::Success
            };
            collector.record_tool_call(&name, status, duration_ms, error_kind.as_deref());
        }

        HostEvent::MessagePartUpdated {
            part: MessagePart::StepFinish,
        } => collector.record_step_finish(),

        HostEvent::FileEdited {
            path,
            lines_added,
            lines_removed,
        } => collector.record_file_change(&path, lines_added, lines_removed),

        HostEvent::CompactionCompleted => collector.record_compaction(),

        HostEvent::TurnRetried => collector.record_retry(),
    }
}
