//! Session orchestration.
//!
//! The [`SessionManager`] is the only owner of the session registry and the
//! per-session log buffers. Each spawned session gets a pump task that turns
//! its [`SessionEvent`]s into log lines, capture feeds and public
//! [`ManagerEvent`]s.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{Adapter, AdapterRegistry};
use crate::capture::{
    CaptureBridge, CaptureDirection, CaptureOptions, CaptureService, InteractionStateChangedInfo,
    SessionCaptureSnapshot,
};
use crate::config::ManagerConfig;
use crate::output::LineBuffer;
use crate::pty::KillSignal;
use crate::rules::AutoResponseRule;
use crate::session::{Session, SessionEvent, SessionOptions};
use crate::stall::{sanitize_for_classifier, StallClassifier, StallSettings};
use crate::types::{
    AuthRequiredInfo, BlockingPromptInfo, LoginInfo, SessionFilter, SessionHandle, SessionMessage,
    SessionMetrics, SessionStatus, SpawnConfig, StopOptions, StopOutcome,
};
use crate::{Error, Result};

/// Events published to subscribers of the manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    SessionStarted(SessionHandle),
    SessionReady(SessionHandle),
    SessionStopped {
        handle: SessionHandle,
        reason: String,
    },
    SessionError {
        handle: SessionHandle,
        message: String,
    },
    LoginRequired {
        handle: SessionHandle,
        info: LoginInfo,
    },
    AuthRequired {
        handle: SessionHandle,
        info: AuthRequiredInfo,
    },
    BlockingPrompt {
        handle: SessionHandle,
        info: BlockingPromptInfo,
        auto_responded: bool,
    },
    Message(SessionMessage),
    Question(SessionMessage),
    StallDetected {
        handle: SessionHandle,
        tail: String,
        duration: Duration,
    },
    SessionStatusChanged {
        handle: SessionHandle,
        from: SessionStatus,
        to: SessionStatus,
    },
    TaskComplete(SessionHandle),
    InteractionStateChanged(InteractionStateChangedInfo),
}

impl ManagerEvent {
    /// Id of the session this event concerns.
    pub fn session_id(&self) -> &str {
        match self {
            ManagerEvent::SessionStarted(handle)
            | ManagerEvent::SessionReady(handle)
            | ManagerEvent::TaskComplete(handle) => &handle.id,
            ManagerEvent::SessionStopped { handle, .. }
            | ManagerEvent::SessionError { handle, .. }
            | ManagerEvent::LoginRequired { handle, .. }
            | ManagerEvent::AuthRequired { handle, .. }
            | ManagerEvent::BlockingPrompt { handle, .. }
            | ManagerEvent::StallDetected { handle, .. }
            | ManagerEvent::SessionStatusChanged { handle, .. } => &handle.id,
            ManagerEvent::Message(message) | ManagerEvent::Question(message) => &message.session_id,
            ManagerEvent::InteractionStateChanged(info) => &info.session_id,
        }
    }

    /// Short name of the event kind, for logs and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::SessionStarted(_) => "session_started",
            ManagerEvent::SessionReady(_) => "session_ready",
            ManagerEvent::SessionStopped { .. } => "session_stopped",
            ManagerEvent::SessionError { .. } => "session_error",
            ManagerEvent::LoginRequired { .. } => "login_required",
            ManagerEvent::AuthRequired { .. } => "auth_required",
            ManagerEvent::BlockingPrompt { .. } => "blocking_prompt",
            ManagerEvent::Message(_) => "message",
            ManagerEvent::Question(_) => "question",
            ManagerEvent::StallDetected { .. } => "stall_detected",
            ManagerEvent::SessionStatusChanged { .. } => "session_status_changed",
            ManagerEvent::TaskComplete(_) => "task_complete",
            ManagerEvent::InteractionStateChanged(_) => "interaction_state_changed",
        }
    }
}

/// Immutable copy of a session's log, iterated oldest first. Can be
/// iterated any number of times.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    lines: Arc<[String]>,
}

impl LogSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl<'a> IntoIterator for &'a LogSnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}

/// Raw byte-level access to a session's terminal.
#[derive(Debug, Clone)]
pub struct TerminalAttachment {
    session: Arc<Session>,
}

/// Live `on_data` callback; removed on drop or [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct DataSubscription {
    task: JoinHandle<()>,
}

impl DataSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for DataSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TerminalAttachment {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Call `callback` with every chunk of raw output. Requires a Tokio runtime.
    pub fn on_data<F>(&self, callback: F) -> DataSubscription
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        let mut rx = self.session.subscribe_raw();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(data) => callback(&data),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Terminal attachment lagged by {} chunks", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        DataSubscription { task }
    }

    /// Receiver of raw output chunks.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.session.subscribe_raw()
    }

    /// Write bytes to the terminal without classification.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.session.write_raw(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.session.resize(cols, rows)
    }
}

struct SessionEntry {
    session: Arc<Session>,
    logs: Arc<Mutex<LineBuffer>>,
    capture: Option<CaptureBridge>,
}

/// Owner of all sessions.
pub struct SessionManager {
    config: ManagerConfig,
    adapters: Arc<RwLock<AdapterRegistry>>,
    sessions: Arc<DashMap<String, SessionEntry>>,
    capture: Option<Arc<dyn CaptureService>>,
    stall: RwLock<StallSettings>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SessionManager {
    /// Manager with the built-in adapters.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, AdapterRegistry::with_defaults())
    }

    /// Manager with the built-in adapters plus the pattern adapters
    /// declared in `config`.
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        let registry = config.adapter_registry()?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ManagerConfig, registry: AdapterRegistry) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let stall = StallSettings {
            enabled: config.stall.enabled,
            timeout: Some(Duration::from_millis(config.stall.timeout_ms)),
            classifier: None,
        };
        Self {
            config,
            adapters: Arc::new(RwLock::new(registry)),
            sessions: Arc::new(DashMap::new()),
            capture: None,
            stall: RwLock::new(stall),
            events,
        }
    }

    /// Attach a capture service. Sessions spawned afterwards are captured.
    pub fn with_capture(mut self, capture: Arc<dyn CaptureService>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Register an adapter, returning the one it replaced.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        self.adapters.write().register(adapter)
    }

    pub fn adapter_types(&self) -> Vec<String> {
        self.adapters.read().list()
    }

    /// Create, register and start a session.
    pub async fn spawn(&self, config: SpawnConfig) -> Result<SessionHandle> {
        let adapter = {
            let adapters = self.adapters.read();
            adapters.get(&config.kind).ok_or_else(|| Error::UnknownAdapter {
                kind: config.kind.clone(),
                registered: adapters.list(),
            })?
        };

        let id = config.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.sessions.contains_key(&id) {
            return Err(Error::DuplicateSession(id));
        }

        let mut config = config;
        config.id = Some(id.clone());

        let stall = self.stall.read().clone();
        let options = SessionOptions {
            rows: self.config.terminal.rows,
            cols: self.config.terminal.cols,
            context_lines: self.config.context_lines,
            stall: stall.clone(),
        };
        let capture_options = CaptureOptions {
            rows: Some(config.rows.unwrap_or(options.rows)),
            cols: Some(config.cols.unwrap_or(options.cols)),
            max_lines: config.capture.max_lines,
            max_bytes: config.capture.max_bytes,
            adapter_type: Some(config.kind.clone()),
        };

        let (session, events_rx) = Session::new(id.clone(), config, adapter, options);
        let logs = Arc::new(Mutex::new(LineBuffer::new(self.config.max_log_lines)));

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateSession(id)),
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    session: Arc::clone(&session),
                    logs: Arc::clone(&logs),
                    capture: None,
                });
            }
        }

        let bridge = match &self.capture {
            Some(service) => match service.open_session(&id, capture_options).await {
                Ok(()) => Some(CaptureBridge::spawn(
                    Arc::clone(service),
                    id.clone(),
                    self.events.clone(),
                )),
                Err(e) => {
                    warn!(session = %id, "Capture session could not be opened: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.capture = bridge.clone();
        }

        let started = session.start();
        let handle = session.handle();
        if started.is_ok() {
            info!(session = %id, kind = %handle.kind, pid = ?handle.pid, "Session started");
            let _ = self.events.send(ManagerEvent::SessionStarted(handle.clone()));
        }

        // Events queued during start are forwarded after SessionStarted
        tokio::spawn(pump(
            Arc::downgrade(&session),
            handle.clone(),
            events_rx,
            logs,
            bridge,
            self.events.clone(),
            stall.classifier,
        ));

        if let Err(e) = started {
            error!(session = %id, "Failed to start session: {}", e);
            self.sessions.remove(&id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Graceful stop with the configured deadline.
    pub fn stop_options(&self) -> StopOptions {
        StopOptions::with_timeout(self.config.stop_timeout())
    }

    /// Stop a session, escalating to a forced kill at the deadline.
    /// The session and its log are removed either way.
    pub async fn stop(&self, id: &str, options: StopOptions) -> Result<StopOutcome> {
        let session = self
            .get_session(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let signal = if options.force {
            KillSignal::Kill
        } else {
            KillSignal::Terminate
        };
        if !session.has_exited() {
            if let Err(e) = session.kill(signal) {
                debug!(session = %id, "Stop signal not delivered: {}", e);
            }
        }

        let outcome = match tokio::time::timeout(options.timeout, session.wait_for_exit()).await {
            Ok(()) => StopOutcome::Exited,
            Err(_) => {
                warn!(
                    session = %id,
                    "Session did not exit within {:?}, sending SIGKILL",
                    options.timeout
                );
                if let Err(e) = session.kill(KillSignal::Kill) {
                    warn!(session = %id, "Forced kill failed: {}", e);
                }
                StopOutcome::Forced
            }
        };

        if let Some((_, entry)) = self.sessions.remove(id) {
            if let Some(capture) = &entry.capture {
                capture.lifecycle("stopped", Some(format!("{:?}", outcome).to_lowercase()));
            }
        }
        info!(session = %id, ?outcome, "Session stopped");
        Ok(outcome)
    }

    /// Stop every session concurrently. Failures are logged.
    pub async fn stop_all(&self, options: StopOptions) -> Vec<(String, StopOutcome)> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.stop(id, options))).await;

        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(outcome) => Some((id, outcome)),
                Err(e) => {
                    warn!(session = %id, "Failed to stop session: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Stop everything with the shutdown deadline and clear the registry.
    pub async fn shutdown(&self) {
        info!("Shutting down {} sessions", self.sessions.len());
        self.stop_all(StopOptions::with_timeout(self.config.shutdown_timeout()))
            .await;
        self.sessions.clear();
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.session.handle())
    }

    /// Handles matching `filter`, ordered by id.
    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.session.handle())
            .filter(|handle| filter.matches(handle))
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn has(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry.session))
    }

    fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.get_session(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Send a message to a session.
    pub fn send(&self, id: &str, message: &str) -> Result<SessionMessage> {
        self.session(id)?.send(message)
    }

    /// Snapshot of the most recent log lines, optionally only the last `tail`.
    pub fn logs(&self, id: &str, tail: Option<usize>) -> Result<LogSnapshot> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let lines = entry.logs.lock().snapshot(tail);
        Ok(LogSnapshot {
            lines: lines.into(),
        })
    }

    pub fn metrics(&self, id: &str) -> Result<SessionMetrics> {
        Ok(self.session(id)?.metrics())
    }

    pub fn attach_terminal(&self, id: &str) -> Option<TerminalAttachment> {
        self.get_session(id)
            .map(|session| TerminalAttachment { session })
    }

    pub fn add_auto_response_rule(&self, id: &str, rule: AutoResponseRule) -> Result<()> {
        self.session(id)?.add_rule(rule);
        Ok(())
    }

    /// Remove the first rule with this pattern source; `false` if none matched.
    pub fn remove_auto_response_rule(&self, id: &str, pattern: &str) -> Result<bool> {
        Ok(self.session(id)?.remove_rule(pattern))
    }

    pub fn set_auto_response_rules(&self, id: &str, rules: Vec<AutoResponseRule>) -> Result<()> {
        self.session(id)?.set_rules(rules);
        Ok(())
    }

    pub fn get_auto_response_rules(&self, id: &str) -> Result<Vec<AutoResponseRule>> {
        Ok(self.session(id)?.rules())
    }

    pub fn clear_auto_response_rules(&self, id: &str) -> Result<()> {
        self.session(id)?.clear_rules();
        Ok(())
    }

    /// Stall settings for sessions spawned from now on.
    pub fn configure_stall_detection(
        &self,
        enabled: bool,
        timeout: Option<Duration>,
        classifier: Option<Arc<dyn StallClassifier>>,
    ) {
        let mut stall = self.stall.write();
        stall.enabled = enabled;
        if timeout.is_some() {
            stall.timeout = timeout;
        }
        stall.classifier = classifier;
        debug!(enabled, timeout = ?stall.timeout, "Stall detection configured");
    }

    /// Number of sessions in each status; every status is present.
    pub fn status_counts(&self) -> BTreeMap<SessionStatus, usize> {
        let mut counts: BTreeMap<SessionStatus, usize> =
            SessionStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for entry in self.sessions.iter() {
            *counts.entry(entry.session.status()).or_default() += 1;
        }
        counts
    }

    /// Capture snapshot, or `None` when capture is off, the session is
    /// unknown, or the service fails.
    pub async fn capture_snapshot(&self, id: &str) -> Option<SessionCaptureSnapshot> {
        let service = self.capture.as_ref()?;
        if !self.has(id) {
            return None;
        }
        match service.snapshot(id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session = %id, "Capture snapshot failed: {}", e);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

/// Forward one session's events to the log, the capture bridge and the
/// public channel. Ends when the session is dropped.
async fn pump(
    session: Weak<Session>,
    mut handle: SessionHandle,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    logs: Arc<Mutex<LineBuffer>>,
    capture: Option<CaptureBridge>,
    events: broadcast::Sender<ManagerEvent>,
    classifier: Option<Arc<dyn StallClassifier>>,
) {
    while let Some(event) = rx.recv().await {
        if let Some(live) = session.upgrade() {
            handle = live.handle();
        }

        let public = match event {
            SessionEvent::Output(text) => {
                logs.lock().feed(&text);
                if let Some(capture) = &capture {
                    capture.feed(&text, CaptureDirection::Stdout);
                }
                None
            }
            SessionEvent::Input(text) => {
                if let Some(capture) = &capture {
                    capture.feed(&text, CaptureDirection::Stdin);
                }
                None
            }
            SessionEvent::Ready(ready) => {
                if let Some(capture) = &capture {
                    capture.lifecycle("ready", None);
                }
                Some(ManagerEvent::SessionReady(ready))
            }
            SessionEvent::Exit { code, reason } => {
                if let Some(capture) = &capture {
                    capture.lifecycle("exit", code.map(|c| c.to_string()));
                }
                Some(ManagerEvent::SessionStopped {
                    handle: handle.clone(),
                    reason,
                })
            }
            SessionEvent::Error(message) => {
                if let Some(capture) = &capture {
                    capture.lifecycle("error", Some(message.clone()));
                }
                Some(ManagerEvent::SessionError {
                    handle: handle.clone(),
                    message,
                })
            }
            SessionEvent::LoginRequired(info) => Some(ManagerEvent::LoginRequired {
                handle: handle.clone(),
                info,
            }),
            SessionEvent::AuthRequired(info) => Some(ManagerEvent::AuthRequired {
                handle: handle.clone(),
                info,
            }),
            SessionEvent::BlockingPrompt {
                info,
                auto_responded,
            } => Some(ManagerEvent::BlockingPrompt {
                handle: handle.clone(),
                info,
                auto_responded,
            }),
            SessionEvent::Message(message) => Some(ManagerEvent::Message(message)),
            SessionEvent::Question(message) => Some(ManagerEvent::Question(message)),
            SessionEvent::TaskComplete => Some(ManagerEvent::TaskComplete(handle.clone())),
            SessionEvent::StatusChanged { from, to } => Some(ManagerEvent::SessionStatusChanged {
                handle: handle.clone(),
                from,
                to,
            }),
            SessionEvent::StallDetected { tail, duration } => {
                let _ = events.send(ManagerEvent::StallDetected {
                    handle: handle.clone(),
                    tail: tail.clone(),
                    duration,
                });
                if let Some(classifier) = &classifier {
                    classify_stall(session.clone(), handle.id.clone(), Arc::clone(classifier), tail, duration);
                }
                None
            }
        };

        if let Some(event) = public {
            let _ = events.send(event);
        }
    }
    debug!(session = %handle.id, "Event pump finished");
}

fn classify_stall(
    session: Weak<Session>,
    id: String,
    classifier: Arc<dyn StallClassifier>,
    tail: String,
    duration: Duration,
) {
    tokio::spawn(async move {
        let sanitized = sanitize_for_classifier(&tail);
        let classification = match classifier.classify(&id, &sanitized, duration).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!(session = %id, "Stall classifier failed: {}", e);
                None
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.handle_stall_classification(classification) {
            warn!(session = %id, "Applying stall classification failed: {}", e);
        }
    });
}
