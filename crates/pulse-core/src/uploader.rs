//! Turn delivery to the collection service.
//!
//! The uploader owns the outbound queue: it batches turns, flushes on size
//! or time triggers, retries transient failures with bounded backoff, and
//! parks data in an offline queue when the network is unreachable. All
//! buffering is in-memory; data is lost if the process dies first, which is
//! an accepted limitation of best-effort telemetry.

use crate::config::{TelemetryConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};
use crate::session::{SessionRecord, SessionUpdate, TurnRecord};
use crate::transport::{TelemetryTransport, TransportError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Attempts per outbound request, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt; doubles per retry.
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Turns buffered while no remote session id exists yet. Beyond this the
/// oldest turn is dropped so an unreachable service cannot grow memory
/// without bound.
pub const MAX_UNATTRIBUTED_TURNS: usize = 100;

/// Batching and retry settings for one uploader.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_base: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }
}

impl UploaderConfig {
    pub fn from_telemetry(config: &TelemetryConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            flush_interval: config.flush_interval(),
            retry_base: DEFAULT_RETRY_BASE,
        }
    }
}

/// An outbound request, kept cloneable so each retry attempt can move a
/// copy onto the blocking pool.
#[derive(Clone)]
enum Request {
    Post { path: String, body: Value },
    Patch { path: String, body: Value },
}

impl Request {
    fn send(&self, transport: &dyn TelemetryTransport) -> Result<Value, TransportError> {
        match self {
            Self::Post { path, body } => transport.post(path, body),
            Self::Patch { path, body } => transport.patch(path, body),
        }
    }
}

/// Reliable, rate-limited delivery of turns to the remote endpoint.
pub struct Uploader {
    transport: Arc<dyn TelemetryTransport>,
    config: UploaderConfig,
    remote_id: Mutex<Option<String>>,
    pending: Mutex<Vec<TurnRecord>>,
    offline_queue: Mutex<Vec<TurnRecord>>,
    online: AtomicBool,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    flush_tasks: Mutex<Vec<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl Uploader {
    pub fn new(transport: Arc<dyn TelemetryTransport>, config: UploaderConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            remote_id: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            offline_queue: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            flush_timer: Mutex::new(None),
            flush_tasks: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    /// Register the session with the service and remember the returned
    /// remote identifier for subsequent turn uploads.
    ///
    /// On failure this logs and returns `None`; the caller proceeds without
    /// a remote id and turn uploads stay buffered until a session exists.
    pub async fn create_session(
        &self,
        session: &SessionRecord,
        initial_turns: &[TurnRecord],
    ) -> Option<String> {
        let mut body = json!({ "session": session });
        if !initial_turns.is_empty() {
            body["turns"] = json!(initial_turns);
        }
        let request = Request::Post {
            path: "/api/v1/sessions".to_string(),
            body,
        };
        match self.send_with_retry("session create", request).await {
            Ok(value) => {
                let id = value.get("id").and_then(Value::as_str).map(str::to_string);
                if id.is_none() {
                    log::warn!("Session create response carried no id");
                }
                *self.remote_id.lock().unwrap() = id.clone();
                id
            }
            Err(_) => None,
        }
    }

    /// Append a finalized turn to the pending buffer.
    ///
    /// Reaching the batch size triggers an asynchronous flush; otherwise a
    /// flush timer is armed if none is live. Never blocks on network I/O.
    pub fn add_turn(self: &Arc<Self>, turn: TurnRecord) {
        if self.finished.load(Ordering::SeqCst) {
            log::debug!("Uploader already shut down; dropping turn");
            return;
        }
        let unattributed = self.remote_id.lock().unwrap().is_none();
        let buffered = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(turn);
            if unattributed && pending.len() > MAX_UNATTRIBUTED_TURNS {
                pending.remove(0);
                log::warn!(
                    "No remote session yet; dropped oldest buffered turn (cap {})",
                    MAX_UNATTRIBUTED_TURNS
                );
            }
            pending.len()
        };
        if buffered >= self.config.batch_size {
            self.spawn_flush();
        } else {
            self.arm_flush_timer();
        }
    }

    /// Send everything currently pending.
    ///
    /// Concurrent invocations are safe: each one operates on whatever is in
    /// the buffer when it swaps, so the same turn is never sent twice.
    pub async fn flush(&self) {
        if let Some(timer) = self.flush_timer.lock().unwrap().take() {
            timer.abort();
        }

        if self.pending.lock().unwrap().is_empty() {
            return;
        }

        let remote_id = self.remote_id.lock().unwrap().clone();
        let Some(remote_id) = remote_id else {
            log::warn!("No remote session id yet; retaining buffered turns");
            return;
        };

        if !self.online.load(Ordering::SeqCst) {
            let drained: Vec<TurnRecord> = self.pending.lock().unwrap().drain(..).collect();
            if !drained.is_empty() {
                log::debug!("Offline; queued {} turn(s)", drained.len());
                self.offline_queue.lock().unwrap().extend(drained);
            }
            return;
        }

        // Swap the buffer out so recording continues while we send.
        let batch: Vec<TurnRecord> = std::mem::take(&mut *self.pending.lock().unwrap());
        if batch.is_empty() {
            return;
        }

        let request = Request::Post {
            path: format!("/api/v1/sessions/{remote_id}/turns"),
            body: json!({ "turns": batch }),
        };
        match self.send_with_retry("turn upload", request).await {
            Ok(_) => log::debug!("Uploaded {} turn(s)", batch.len()),
            Err(e) if e.is_retryable() => {
                // Prepend the failed batch to whatever accumulated since the
                // swap: order preserved, nothing dropped.
                let mut pending = self.pending.lock().unwrap();
                let mut restored = batch;
                restored.extend(pending.drain(..));
                *pending = restored;
            }
            Err(e) => {
                log::error!("Discarding {} turn(s) after terminal error: {e}", batch.len());
            }
        }
    }

    /// Best-effort PATCH of session-level fields at session end.
    pub async fn update_session(&self, update: &SessionUpdate) {
        let remote_id = self.remote_id.lock().unwrap().clone();
        let Some(remote_id) = remote_id else {
            log::debug!("No remote session id; skipping session update");
            return;
        };
        let body = match serde_json::to_value(update) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Failed to serialize session update: {e}");
                return;
            }
        };
        let request = Request::Patch {
            path: format!("/api/v1/sessions/{remote_id}"),
            body,
        };
        if let Err(e) = self.send_with_retry("session update", request).await {
            log::debug!("Session update not delivered: {e}");
        }
    }

    /// Flip network availability. The offline→online edge drains the
    /// offline queue into pending and attempts a flush; the drain happens
    /// exactly once per transition.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            self.drain_offline_queue();
            self.flush().await;
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// True once `shutdown` has run; a finished uploader accepts no turns.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// True once the session has been registered with the service.
    pub fn has_remote_session(&self) -> bool {
        self.remote_id.lock().unwrap().is_some()
    }

    /// Final flush at session end. Also drains the offline queue when the
    /// network came back. Safe to call more than once; only the first call
    /// does work.
    pub async fn shutdown(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        // Let in-flight size-triggered flushes finish first.
        let tasks: Vec<JoinHandle<()>> = self.flush_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.flush().await;

        if self.online.load(Ordering::SeqCst) && !self.offline_queue.lock().unwrap().is_empty() {
            self.drain_offline_queue();
            self.flush().await;
        }
    }

    /// Move everything queued offline to the front of the pending buffer,
    /// preserving turn order.
    fn drain_offline_queue(&self) {
        let queued: Vec<TurnRecord> = self.offline_queue.lock().unwrap().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        let mut restored = queued;
        restored.extend(pending.drain(..));
        *pending = restored;
    }

    fn spawn_flush(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            log::debug!("No async runtime; flush deferred to the next flush point");
            return;
        }
        let uploader = Arc::clone(self);
        let handle = tokio::spawn(async move { uploader.flush().await });
        self.flush_tasks.lock().unwrap().push(handle);
    }

    fn arm_flush_timer(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut timer = self.flush_timer.lock().unwrap();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let uploader = Arc::clone(self);
        let interval = self.config.flush_interval;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            // Disarm before flushing so flush's timer abort cannot cancel
            // this task mid-send.
            uploader.flush_timer.lock().unwrap().take();
            uploader.flush().await;
        }));
    }

    /// Up to [`MAX_ATTEMPTS`] tries. 4xx is terminal. 5xx and network
    /// failures back off exponentially; a network failure also flips the
    /// uploader offline.
    async fn send_with_retry(
        &self,
        what: &str,
        request: Request,
    ) -> Result<Value, TransportError> {
        let mut attempt = 1;
        loop {
            let transport = Arc::clone(&self.transport);
            let req = request.clone();
            let result = tokio::task::spawn_blocking(move || req.send(transport.as_ref()))
                .await
                .unwrap_or_else(|e| Err(TransportError::Network(format!("send task failed: {e}"))));

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_network() {
                        self.online.store(false, Ordering::SeqCst);
                    }
                    if e.is_client_error() {
                        log::error!("Telemetry {what} rejected: {e}");
                        return Err(e);
                    }
                    if !e.is_retryable() || attempt >= MAX_ATTEMPTS {
                        log::warn!("Telemetry {what} failed after {attempt} attempt(s): {e}");
                        return Err(e);
                    }
                    let backoff = self.config.retry_base * 2u32.pow(attempt - 1);
                    log::debug!("Telemetry {what} attempt {attempt} failed ({e}); retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
