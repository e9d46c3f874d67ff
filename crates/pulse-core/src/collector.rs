//! Session and turn lifecycle orchestration.
//!
//! The [`TelemetryCollector`] is the single entry point for recording: it
//! gates everything behind the resolved consent, sanitizes content before
//! it touches a record, feeds the signal tracker, and hands finalized turns
//! to the uploader. Recording calls are synchronous and never block on
//! network I/O; the network work runs on spawned tasks that `end_session`
//! awaits.
//!
//! No failure in here may ever disturb the host application: every public
//! method is a no-op when disabled or when the required session/turn
//! context is missing.

use crate::config::TelemetryConfig;
use crate::consent::{ConsentResolver, ConsentStatus};
use crate::sanitize::{self, Sanitizer};
use crate::session::{
    AssistantMessageRecord, DataLevel, FileChangeRecord, SessionRecord, SessionUpdate, Tier,
    ToolCallRecord, ToolStatus, TurnRecord, UserMessageRecord,
};
use crate::signals::SignalTracker;
use crate::transport::{HttpTransport, TelemetryTransport};
use crate::uploader::{Uploader, UploaderConfig};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Upper bound on sanitized message content shipped per message.
const MAX_CONTENT_LEN: usize = 4096;

/// State owned exclusively by the collector while a session is open.
struct ActiveSession {
    record: SessionRecord,
    started: Instant,
    tracker: SignalTracker,
    current_turn: Option<TurnRecord>,
    next_turn_index: u32,
}

/// Client-side telemetry pipeline entry point.
///
/// One instance per host process, caller-owned and shared via `Arc`. The
/// host is expected to serialize recording calls per session; network
/// operations run concurrently on background tasks.
pub struct TelemetryCollector {
    config: TelemetryConfig,
    transport: Arc<dyn TelemetryTransport>,
    authenticated: bool,
    resolver: Arc<ConsentResolver>,
    sanitizer: Sanitizer,
    enabled: AtomicBool,
    consent: Mutex<Option<ConsentStatus>>,
    session: Mutex<Option<ActiveSession>>,
    uploader: Mutex<Option<Arc<Uploader>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryCollector {
    /// Build a collector talking to the configured endpoint, authenticated
    /// with `auth_token` when present.
    pub fn new(config: TelemetryConfig, auth_token: Option<String>) -> Self {
        let transport: Arc<dyn TelemetryTransport> = Arc::new(HttpTransport::new(
            config.endpoint().to_string(),
            auth_token.clone(),
        ));
        Self::with_transport(config, transport, auth_token.is_some())
    }

    /// Build a collector over an explicit transport (tests, custom stacks).
    pub fn with_transport(
        config: TelemetryConfig,
        transport: Arc<dyn TelemetryTransport>,
        authenticated: bool,
    ) -> Self {
        let resolver = Arc::new(ConsentResolver::new(config.clone(), Arc::clone(&transport)));
        let sanitizer = Sanitizer::new(&config.exclude_patterns);
        Self {
            config,
            transport,
            authenticated,
            resolver,
            sanitizer,
            enabled: AtomicBool::new(false),
            consent: Mutex::new(None),
            session: Mutex::new(None),
            uploader: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolve consent and activate the pipeline.
    ///
    /// When consent comes back disabled, every subsequent recording call is
    /// a no-op. Never fails: consent resolution degrades to conservative
    /// defaults on any error.
    pub async fn initialize(&self) {
        let resolver = Arc::clone(&self.resolver);
        let authenticated = self.authenticated;
        let status = tokio::task::spawn_blocking(move || resolver.resolve(authenticated))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Consent resolution task failed: {e}");
                ConsentStatus {
                    user_id: None,
                    tier: Tier::Free,
                    telemetry_enabled: false,
                    data_level: DataLevel::MetricsOnly,
                }
            });

        if !status.telemetry_enabled {
            log::info!("Telemetry disabled by consent");
            self.enabled.store(false, Ordering::SeqCst);
            return;
        }

        *self.consent.lock().unwrap() = Some(status);
        *self.uploader.lock().unwrap() = Some(Uploader::new(
            Arc::clone(&self.transport),
            UploaderConfig::from_telemetry(&self.config),
        ));
        self.enabled.store(true, Ordering::SeqCst);
        log::debug!("Telemetry pipeline active");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Drop the cached consent answer. Must be called whenever the user
    /// changes consent-relevant configuration.
    pub fn invalidate_consent(&self) {
        self.resolver.clear_cache();
    }

    /// Open a session and register it with the service in the background.
    pub fn start_session(&self, id: &str, user_id: &str, org_id: &str) {
        if !self.is_enabled() {
            return;
        }
        let consent = self.consent.lock().unwrap().clone();
        let Some(consent) = consent else {
            return;
        };

        let uploader = self.fresh_uploader();
        let record = SessionRecord::new(
            id.to_string(),
            user_id.to_string(),
            org_id.to_string(),
            self.config.environment(),
            consent.tier,
            consent.data_level,
        );

        {
            let mut guard = self.session.lock().unwrap();
            if guard.is_some() {
                log::warn!("Starting telemetry session [{}] with one still open; abandoning the previous one", id);
            }
            *guard = Some(ActiveSession {
                record: record.clone(),
                started: Instant::now(),
                tracker: SignalTracker::new(),
                current_turn: None,
                next_turn_index: 0,
            });
        }

        // Fire-and-forget relative to the caller; end_session awaits it so
        // the remote id exists before the final update.
        if tokio::runtime::Handle::try_current().is_ok() {
            let task = tokio::spawn(async move {
                uploader.create_session(&record, &[]).await;
            });
            self.tasks.lock().unwrap().push(task);
        } else {
            log::warn!("No async runtime; telemetry session [{}] not registered", id);
        }
        log::debug!("Telemetry session started [{}]", id);
    }

    /// Record a user message, opening a new turn.
    ///
    /// Any turn still open at this point is finalized first: uploaded if
    /// complete, dropped otherwise.
    pub fn record_user_message(&self, content: &str, has_images: bool, has_files: bool) {
        if !self.is_enabled() {
            return;
        }
        let include_content = self.include_content();
        let uploader = self.uploader_handle();
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };

        Self::finalize_turn(session, uploader.as_ref());

        let index = session.next_turn_index;
        session.next_turn_index += 1;
        let mut turn = TurnRecord::new(index);
        turn.user_message = Some(UserMessageRecord {
            content: include_content
                .then(|| sanitize::truncate(&sanitize::redact(content), MAX_CONTENT_LEN)),
            length: content.chars().count(),
            has_images,
            has_files,
        });
        session.current_turn = Some(turn);
        session.tracker.start_turn();
    }

    /// Record the assistant response for the open turn. Silently returns
    /// when no turn is open, since a turn is only opened by a user message.
    #[allow(clippy::too_many_arguments)]
    pub fn record_assistant_message(
        &self,
        content: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        latency_ms: u64,
        cost_usd: Option<f64>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let include_content = self.include_content();
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };
        let Some(turn) = session.current_turn.as_mut() else {
            return;
        };

        turn.assistant_message = Some(AssistantMessageRecord {
            content: include_content
                .then(|| sanitize::truncate(&sanitize::redact(content), MAX_CONTENT_LEN)),
            length: content.chars().count(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            latency_ms,
        });
        if let Some(cost) = cost_usd {
            session.record.metrics.cost_usd += cost;
        }
        // The exchange is complete for signal purposes; the record itself
        // stays open for trailing steps until the next finalize point.
        session.tracker.end_turn();
    }

    /// Record a completed tool call on the open turn.
    pub fn record_tool_call(
        &self,
        name: &str,
        status: ToolStatus,
        duration_ms: u64,
        error_kind: Option<&str>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };
        let Some(turn) = session.current_turn.as_mut() else {
            return;
        };

        turn.tool_calls.push(ToolCallRecord {
            name: name.to_string(),
            status,
            duration_ms,
            error_kind: error_kind.map(str::to_string),
        });
        session.record.metrics.tool_calls += 1;
        if status == ToolStatus::Error {
            session.record.metrics.tool_errors += 1;
        }
    }

    /// Record a file edit on the open turn. Sensitive paths are excluded
    /// entirely: no record, no metric movement.
    pub fn record_file_change(&self, path: &str, lines_added: u32, lines_removed: u32) {
        if !self.is_enabled() {
            return;
        }
        if self.sanitizer.is_sensitive_file(path) {
            log::debug!("Skipping file change on sensitive path");
            return;
        }
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };
        let Some(turn) = session.current_turn.as_mut() else {
            return;
        };

        turn.file_changes.push(FileChangeRecord {
            path_hash: sanitize::hash_path(path),
            extension: Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase()),
            lines_added,
            lines_removed,
        });
        session.record.metrics.lines_added += lines_added;
        session.record.metrics.lines_removed += lines_removed;
    }

    /// Record that the user retried the current exchange.
    pub fn record_retry(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };
        session.tracker.record_retry();
        if let Some(turn) = session.current_turn.as_mut() {
            turn.retried = true;
        }
    }

    /// Record a completed context compaction.
    pub fn record_compaction(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Some(session) = self.session.lock().unwrap().as_mut() {
            session.tracker.record_compaction();
        }
    }

    /// Record an error kind for the session's quality signals.
    pub fn record_error(&self, kind: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Some(session) = self.session.lock().unwrap().as_mut() {
            session.tracker.record_error(kind);
        }
    }

    /// A step boundary from the host: finalize the open turn if its
    /// exchange is complete, leaving an in-flight turn untouched.
    pub fn record_step_finish(&self) {
        if !self.is_enabled() {
            return;
        }
        let uploader = self.uploader_handle();
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if session
            .current_turn
            .as_ref()
            .is_some_and(TurnRecord::is_complete)
        {
            Self::finalize_turn(session, uploader.as_ref());
        }
    }

    /// Close the active session: finalize the open turn, project signals,
    /// push the final session update, and drain the uploader.
    ///
    /// `explicit` distinguishes a user-driven end from process teardown;
    /// an implicit end marks the session abandoned. Calling this with no
    /// active session is a no-op.
    pub async fn end_session(&self, explicit: bool) {
        if !self.is_enabled() {
            return;
        }

        // Let the background session registration settle so the final
        // update can be attributed.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let uploader = self.uploader_handle();
        let update = {
            let mut guard = self.session.lock().unwrap();
            let Some(mut session) = guard.take() else {
                return;
            };
            // Signals first: finalizing the turn must not erase the
            // mid-turn abandonment evidence.
            let signals = session.tracker.signals(explicit);
            Self::finalize_turn(&mut session, uploader.as_ref());
            SessionUpdate {
                ended_at: Some(Utc::now()),
                duration_ms: Some(session.started.elapsed().as_millis() as u64),
                metrics: Some(session.record.metrics.clone()),
                model_usage: session.record.model_usage.clone(),
                signals: Some(signals),
            }
        };

        if let Some(uploader) = uploader {
            uploader.update_session(&update).await;
            uploader.shutdown().await;
        }
        log::debug!("Telemetry session ended");
    }

    /// Process-teardown hook: ends any active session as abandoned.
    pub async fn shutdown(&self) {
        self.end_session(false).await;
    }

    /// Move the open turn to the uploader, or drop it if incomplete.
    /// Tracker state is left alone; signal projection owns that.
    fn finalize_turn(session: &mut ActiveSession, uploader: Option<&Arc<Uploader>>) {
        let Some(turn) = session.current_turn.take() else {
            return;
        };
        if !turn.is_complete() {
            log::debug!("Dropping incomplete turn {}", turn.turn_index);
            return;
        }

        session.record.metrics.turn_count += 1;
        if let Some(assistant) = &turn.assistant_message {
            session.record.metrics.input_tokens += assistant.input_tokens;
            session.record.metrics.output_tokens += assistant.output_tokens;
            let usage = session
                .record
                .model_usage
                .entry(assistant.model.clone())
                .or_default();
            usage.turns += 1;
            usage.input_tokens += assistant.input_tokens;
            usage.output_tokens += assistant.output_tokens;
        }

        match uploader {
            Some(uploader) => uploader.add_turn(turn),
            None => log::debug!("No uploader; discarding finalized turn"),
        }
    }

    fn include_content(&self) -> bool {
        self.consent
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.data_level == DataLevel::Full)
            .unwrap_or(false)
    }

    fn uploader_handle(&self) -> Option<Arc<Uploader>> {
        self.uploader.lock().unwrap().clone()
    }

    /// The uploader for a new session. Remote session ids are per-session,
    /// so a used or finished uploader is replaced with a fresh one bound to
    /// the same transport and settings.
    fn fresh_uploader(&self) -> Arc<Uploader> {
        let mut guard = self.uploader.lock().unwrap();
        match guard.as_ref() {
            Some(u) if !u.is_finished() && !u.has_remote_session() => Arc::clone(u),
            _ => {
                let uploader = Uploader::new(
                    Arc::clone(&self.transport),
                    UploaderConfig::from_telemetry(&self.config),
                );
                *guard = Some(Arc::clone(&uploader));
                uploader
            }
        }
    }
}
