//! One supervised agent process and its interaction state machine.
//!
//! A [`Session`] owns the pseudo-terminal of a single CLI tool. Output is
//! read on a blocking thread, reassembled into UTF-8, broadcast raw to any
//! attached terminal, stripped of control sequences and handed to the
//! session's [`Adapter`]. The signals it returns drive the status machine:
//!
//! ```text
//! pending → starting → authenticating → ready ⇄ busy → stopping → stopped
//!                                                               ↘ error
//! ```
//!
//! Everything the session observes is reported as a [`SessionEvent`] on an
//! unbounded channel, in the order the terminal produced it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, ClassifyContext, StateSignal};
use crate::ansi::Normalizer;
use crate::keys;
use crate::output::LineBuffer;
use crate::pty::{self, KillSignal, LaunchRequest, PtyProcess};
use crate::rules::{AutoResponseRule, RuleSet};
use crate::stall::{StallAction, StallClassification, StallDetector, StallSettings};
use crate::types::{
    AuthRequiredInfo, BlockingPromptInfo, LoginInfo, MessageDirection, MessageKind,
    SessionHandle, SessionMessage, SessionMetrics, SessionStatus, SpawnConfig,
};
use crate::{Error, Result};

/// Capacity of the raw output broadcast used by terminal attachments.
const RAW_CHANNEL_CAPACITY: usize = 1024;

/// Characters of recent output carried by a stall event.
const STALL_TAIL_CHARS: usize = 4000;

/// How long output is still collected after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Everything a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw terminal output, control sequences included
    Output(String),
    /// Bytes written to the terminal
    Input(String),
    /// Startup finished; the handle is taken at the moment of the change
    Ready(SessionHandle),
    LoginRequired(LoginInfo),
    AuthRequired(AuthRequiredInfo),
    BlockingPrompt {
        info: BlockingPromptInfo,
        auto_responded: bool,
    },
    /// Reply collected after a task
    Message(SessionMessage),
    /// Reply that ends in a question
    Question(SessionMessage),
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    TaskComplete,
    StallDetected {
        tail: String,
        duration: Duration,
    },
    Exit {
        code: Option<i32>,
        reason: String,
    },
    Error(String),
}

/// Per-session settings decided by the manager.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub rows: u16,
    pub cols: u16,
    pub context_lines: usize,
    pub stall: StallSettings,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            rows: 40,
            cols: 120,
            context_lines: 200,
            stall: StallSettings::default(),
        }
    }
}

/// Reply being collected while busy.
#[derive(Debug)]
struct PendingReply {
    echo: String,
    text: String,
}

struct SessionState {
    status: SessionStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    last_activity_at: Option<DateTime<Utc>>,
    error: Option<String>,
    exit_code: Option<i32>,
    exit_reason: Option<String>,
    rows: u16,
    cols: u16,
    rules: RuleSet,
    context: LineBuffer,
    normalizer: Normalizer,
    utf8_pending: Vec<u8>,
    reply: Option<PendingReply>,
    last_prompt: Option<String>,
    stall: StallDetector,
    messages_sent: u64,
    output_bytes: u64,
}

/// A supervised CLI process.
pub struct Session {
    id: String,
    config: SpawnConfig,
    adapter: Arc<dyn Adapter>,
    state: Mutex<SessionState>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    process: Mutex<Option<Arc<PtyProcess>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    raw: broadcast::Sender<Vec<u8>>,
    exited: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.config.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Create a pending session. Events arrive on the returned receiver.
    pub fn new(
        id: impl Into<String>,
        config: SpawnConfig,
        adapter: Arc<dyn Adapter>,
        options: SessionOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (raw, _) = broadcast::channel(RAW_CHANNEL_CAPACITY);
        let (exited, _) = watch::channel(false);

        let state = SessionState {
            status: SessionStatus::Pending,
            pid: None,
            started_at: None,
            started: None,
            last_activity_at: None,
            error: None,
            exit_code: None,
            exit_reason: None,
            rows: config.rows.unwrap_or(options.rows),
            cols: config.cols.unwrap_or(options.cols),
            rules: RuleSet::new(adapter.auto_response_rules()),
            context: LineBuffer::new(options.context_lines),
            normalizer: Normalizer::new(),
            utf8_pending: Vec::new(),
            reply: None,
            last_prompt: None,
            stall: StallDetector::from_settings(&options.stall),
            messages_sent: 0,
            output_bytes: 0,
        };

        let session = Arc::new(Self {
            id: id.into(),
            config,
            adapter,
            state: Mutex::new(state),
            writer: Mutex::new(None),
            process: Mutex::new(None),
            events,
            raw,
            exited,
        });
        (session, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Current read-only projection of the session.
    pub fn handle(&self) -> SessionHandle {
        self.handle_from(&self.state.lock())
    }

    fn handle_from(&self, st: &SessionState) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind.clone(),
            status: st.status,
            pid: st.pid,
            role: self.config.role.clone(),
            capabilities: self.config.capabilities.clone(),
            started_at: st.started_at,
            last_activity_at: st.last_activity_at,
            error: st.error.clone(),
            exit_code: st.exit_code,
        }
    }

    pub fn metrics(&self) -> SessionMetrics {
        let st = self.state.lock();
        SessionMetrics {
            status: st.status,
            uptime: st.started.map(|t| t.elapsed()).unwrap_or_default(),
            messages_sent: st.messages_sent,
            output_bytes: st.output_bytes,
            last_activity_at: st.last_activity_at,
        }
    }

    /// Raw terminal output as it arrives.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Vec<u8>> {
        self.raw.subscribe()
    }

    /// Whether the process has exited and its output has been drained.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the process has exited. Never resolves for a session
    /// that was not started.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Launch the process and start the I/O task. Requires a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let request = {
            let mut st = self.state.lock();
            if st.status != SessionStatus::Pending {
                return Err(Error::InvalidState {
                    id: self.id.clone(),
                    status: st.status,
                });
            }
            self.transition(&mut st, SessionStatus::Starting);
            self.launch_request(&st)
        };

        info!(session = %self.id, program = %request.program, "Starting session");

        let spawned = match pty::spawn(&request) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail(e.to_string());
                self.exited.send_replace(true);
                return Err(e);
            }
        };

        let process = Arc::new(spawned.process);
        {
            let mut st = self.state.lock();
            st.pid = process.pid();
            st.started_at = Some(Utc::now());
            st.started = Some(Instant::now());
            st.stall.reset();
        }
        *self.writer.lock() = Some(spawned.writer);
        *self.process.lock() = Some(process);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let reader = spawned.reader;
        let session_id = self.id.clone();
        tokio::task::spawn_blocking(move || read_loop(reader, out_tx, &session_id));

        let (exit_tx, exit_rx) = oneshot::channel();
        let mut child = spawned.child;
        tokio::task::spawn_blocking(move || {
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            let _ = exit_tx.send(code);
        });

        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_io(out_rx, exit_rx).await });

        Ok(())
    }

    fn launch_request(&self, st: &SessionState) -> LaunchRequest {
        let mut env = self.adapter.env(&self.config);
        env.extend(self.config.env.clone());

        let cwd: Option<std::path::PathBuf> = self
            .config
            .workdir
            .as_ref()
            .map(|dir| shellexpand::tilde(&dir.to_string_lossy()).into_owned().into());

        LaunchRequest {
            program: self.adapter.command().to_string(),
            args: self.adapter.args(&self.config),
            cwd,
            env,
            rows: st.rows,
            cols: st.cols,
        }
    }

    async fn run_io(
        self: Arc<Self>,
        mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut exit_rx: oneshot::Receiver<Option<i32>>,
    ) {
        let (stall_enabled, stall_period) = {
            let st = self.state.lock();
            let period = (st.stall.timeout() / 4)
                .clamp(Duration::from_millis(10), Duration::from_secs(1));
            (st.stall.is_enabled(), period)
        };
        let mut ticker = tokio::time::interval(stall_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut exit = None;
        loop {
            tokio::select! {
                chunk = out_rx.recv() => match chunk {
                    Some(data) => self.ingest(&data),
                    None => break,
                },
                code = &mut exit_rx => {
                    exit = Some(code.ok().flatten());
                    break;
                }
                _ = ticker.tick(), if stall_enabled => self.check_stall(),
            }
        }

        let code = match exit {
            Some(code) => {
                // Exit can overtake the last reads; collect what is left
                while let Ok(Some(data)) = tokio::time::timeout(DRAIN_GRACE, out_rx.recv()).await {
                    self.ingest(&data);
                }
                code
            }
            None => exit_rx.await.ok().flatten(),
        };

        self.finish(code);
    }

    /// Feed one chunk of raw terminal output through the pipeline.
    pub(crate) fn ingest(&self, data: &[u8]) {
        let mut writes = Vec::new();
        {
            let mut st = self.state.lock();
            st.output_bytes += data.len() as u64;
            st.last_activity_at = Some(Utc::now());
            let _ = self.raw.send(data.to_vec());

            let text = decode_utf8(&mut st.utf8_pending, data);
            if text.is_empty() {
                return;
            }
            self.emit(SessionEvent::Output(text.clone()));

            let clean = st.normalizer.push(&text);
            if clean.chars().any(|c| !c.is_whitespace()) {
                st.stall.activity();
            }
            st.context.feed(&clean);
            if let Some(reply) = st.reply.as_mut() {
                reply.text.push_str(&clean);
            }

            let buffer = st.context.text();
            let ctx = ClassifyContext {
                buffer: &buffer,
                status: st.status,
            };
            let signals = self.adapter.classify(&clean, &ctx);
            for signal in signals {
                self.apply_signal(&mut st, signal, &mut writes);
            }
        }

        for input in writes {
            if let Err(e) = self.write_input(&input) {
                warn!(session = %self.id, "Auto-response write failed: {}", e);
            }
        }
    }

    fn apply_signal(&self, st: &mut SessionState, signal: StateSignal, writes: &mut Vec<String>) {
        match signal {
            StateSignal::Ready => match st.status {
                SessionStatus::Starting | SessionStatus::Authenticating => {
                    self.transition(st, SessionStatus::Ready);
                    self.emit(SessionEvent::Ready(self.handle_from(st)));
                }
                SessionStatus::Busy => self.complete_task(st, false),
                _ => {}
            },
            StateSignal::TaskComplete => {
                if st.status == SessionStatus::Busy {
                    self.complete_task(st, true);
                }
            }
            StateSignal::AuthRequired(info) => {
                if matches!(
                    st.status,
                    SessionStatus::Starting | SessionStatus::Ready | SessionStatus::Busy
                ) {
                    info!(session = %self.id, method = ?info.method, "Authentication required");
                    self.transition(st, SessionStatus::Authenticating);
                    self.emit(SessionEvent::LoginRequired(LoginInfo::from(&info)));
                    self.emit(SessionEvent::AuthRequired(info));
                }
            }
            StateSignal::BlockingPrompt(info) => self.handle_prompt(st, info, writes),
            StateSignal::Exited { reason } => {
                if st.status.is_live() && st.status != SessionStatus::Stopping {
                    st.exit_reason = Some(reason);
                    self.transition(st, SessionStatus::Stopping);
                }
            }
        }
    }

    fn handle_prompt(&self, st: &mut SessionState, info: BlockingPromptInfo, writes: &mut Vec<String>) {
        if st.last_prompt.as_deref() == Some(info.prompt.as_str()) {
            return;
        }

        match st.rules.evaluate(&info.prompt) {
            Some(matched) => {
                info!(
                    session = %self.id,
                    pattern = %matched.pattern,
                    response = %matched.response,
                    "Auto-responding to prompt"
                );
                writes.push(matched.input);
                // The answered prompt must be printed again to count again
                st.context.clear();
                st.last_prompt = None;
                self.emit(SessionEvent::BlockingPrompt {
                    info,
                    auto_responded: true,
                });
            }
            None => {
                debug!(session = %self.id, prompt = %info.prompt, "Blocking prompt");
                st.last_prompt = Some(info.prompt.clone());
                self.emit(SessionEvent::BlockingPrompt {
                    info,
                    auto_responded: false,
                });
            }
        }
    }

    /// Finish the running task. An explicit completion signal always ends
    /// it; a ready prompt that only follows the echoed input does not.
    fn complete_task(&self, st: &mut SessionState, explicit: bool) {
        let Some(reply) = st.reply.as_mut() else {
            self.transition(st, SessionStatus::Ready);
            self.emit(SessionEvent::TaskComplete);
            return;
        };
        let content = extract_reply(&reply.text, &reply.echo);
        if content.is_empty() && !explicit {
            // Only the echoed input so far; collect from here on
            if reply.text.contains(reply.echo.trim()) {
                reply.echo.clear();
                reply.text.clear();
            }
            return;
        }
        st.reply = None;
        self.transition(st, SessionStatus::Ready);
        if content.is_empty() {
            self.emit(SessionEvent::TaskComplete);
            return;
        }

        let is_question = content.ends_with('?');
        self.emit(SessionEvent::Message(SessionMessage::new(
            &self.id,
            MessageDirection::Inbound,
            MessageKind::Response,
            content.clone(),
        )));
        if is_question {
            self.emit(SessionEvent::Question(SessionMessage::new(
                &self.id,
                MessageDirection::Inbound,
                MessageKind::Question,
                content,
            )));
        }
        self.emit(SessionEvent::TaskComplete);
    }

    fn transition(&self, st: &mut SessionState, to: SessionStatus) {
        let from = st.status;
        if from == to {
            return;
        }
        st.status = to;
        st.context.clear();
        st.last_prompt = None;
        if matches!(to, SessionStatus::Starting | SessionStatus::Busy) {
            st.stall.reset();
        }
        debug!(session = %self.id, %from, %to, "Status changed");
        self.emit(SessionEvent::StatusChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        // The receiver is gone only once the owner has dropped the session
        let _ = self.events.send(event);
    }

    /// Record a fatal failure.
    fn fail(&self, message: String) {
        error!(session = %self.id, "Session failed: {}", message);
        let mut st = self.state.lock();
        st.error = Some(message.clone());
        self.transition(&mut st, SessionStatus::Error);
        self.emit(SessionEvent::Error(message));
    }

    fn finish(&self, code: Option<i32>) {
        let reason = {
            let mut st = self.state.lock();
            st.exit_code = code;
            if st.status != SessionStatus::Error {
                self.transition(&mut st, SessionStatus::Stopped);
            }
            st.exit_reason.take().unwrap_or_else(|| match code {
                Some(0) => "exited".to_string(),
                Some(code) => format!("exited with code {}", code),
                None => "terminated".to_string(),
            })
        };
        info!(session = %self.id, exit_code = ?code, %reason, "Session exited");

        self.writer.lock().take();
        self.exited.send_replace(true);
        self.emit(SessionEvent::Exit { code, reason });
    }

    /// Write a task or reply. `Enter` is appended; the session becomes
    /// busy if it was ready. Does not wait for an answer.
    pub fn send(&self, message: &str) -> Result<SessionMessage> {
        let formatted = self.adapter.format_input(message);
        {
            let mut st = self.state.lock();
            match st.status {
                SessionStatus::Ready => self.transition(&mut st, SessionStatus::Busy),
                SessionStatus::Starting | SessionStatus::Authenticating | SessionStatus::Busy => {}
                status => {
                    return Err(Error::InvalidState {
                        id: self.id.clone(),
                        status,
                    })
                }
            }
            if st.status == SessionStatus::Busy {
                st.reply = Some(PendingReply {
                    echo: message.to_string(),
                    text: String::new(),
                });
            }
            st.last_prompt = None;
            st.messages_sent += 1;
        }

        self.write_input(&format!("{}\r", formatted))?;
        debug!(session = %self.id, "Sent message ({} chars)", message.len());

        Ok(SessionMessage::new(
            &self.id,
            MessageDirection::Outbound,
            MessageKind::Task,
            message,
        ))
    }

    /// Press named keys (see [`keys::encode`]).
    pub fn send_keys<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let input = keys::encode_all(names)?;
        self.state.lock().last_prompt = None;
        self.write_input(&input)
    }

    /// Insert text as a bracketed paste; nothing is submitted.
    pub fn paste(&self, text: &str) -> Result<()> {
        self.write_input(&keys::bracketed_paste(text))
    }

    /// Write bytes straight to the terminal.
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(data)?;
        self.emit(SessionEvent::Input(String::from_utf8_lossy(data).into_owned()));
        Ok(())
    }

    fn write_input(&self, input: &str) -> Result<()> {
        self.write_bytes(input.as_bytes())?;
        self.emit(SessionEvent::Input(input.to_string()));
        Ok(())
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or_else(|| Error::InvalidState {
            id: self.id.clone(),
            status: self.status(),
        })?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let process = self.process.lock().clone();
        let process = process.ok_or_else(|| Error::InvalidState {
            id: self.id.clone(),
            status: self.status(),
        })?;
        process.resize(rows, cols)?;
        let mut st = self.state.lock();
        st.rows = rows;
        st.cols = cols;
        Ok(())
    }

    /// Signal the process. Live sessions move to `stopping`; exit is
    /// reported later through [`SessionEvent::Exit`].
    pub fn kill(&self, signal: KillSignal) -> Result<()> {
        let process = self.process.lock().clone();
        let process = process.ok_or_else(|| Error::InvalidState {
            id: self.id.clone(),
            status: self.status(),
        })?;
        if self.has_exited() {
            return Ok(());
        }

        {
            let mut st = self.state.lock();
            if st.status.is_live() {
                self.transition(&mut st, SessionStatus::Stopping);
            }
        }
        info!(session = %self.id, %signal, "Killing session");
        process.signal(signal)
    }

    pub fn add_rule(&self, rule: AutoResponseRule) {
        self.state.lock().rules.add(rule);
    }

    pub fn remove_rule(&self, pattern: &str) -> bool {
        self.state.lock().rules.remove(pattern)
    }

    pub fn set_rules(&self, rules: Vec<AutoResponseRule>) {
        self.state.lock().rules.set(rules);
    }

    pub fn rules(&self) -> Vec<AutoResponseRule> {
        self.state.lock().rules.get()
    }

    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    /// Emit a stall event if the timer has run out.
    pub(crate) fn check_stall(&self) {
        let mut st = self.state.lock();
        if !matches!(st.status, SessionStatus::Starting | SessionStatus::Busy) {
            return;
        }
        if let Some(duration) = st.stall.check() {
            let tail = st.context.tail_chars(STALL_TAIL_CHARS);
            warn!(session = %self.id, ?duration, "Session stalled");
            self.emit(SessionEvent::StallDetected { tail, duration });
        }
    }

    /// Apply a stall verdict and restart the stall timer.
    pub fn handle_stall_classification(
        &self,
        classification: Option<StallClassification>,
    ) -> Result<()> {
        self.state.lock().stall.reset();

        let Some(classification) = classification else {
            debug!(session = %self.id, "No stall verdict; continuing");
            return Ok(());
        };
        info!(
            session = %self.id,
            action = ?classification.action,
            reason = ?classification.reason,
            "Stall classified"
        );
        match classification.action {
            StallAction::Continue => Ok(()),
            StallAction::Respond(text) => self.write_input(&format!("{}\r", text)),
            StallAction::Terminate => self.kill(KillSignal::Terminate),
        }
    }

    #[cfg(test)]
    pub(crate) fn attach_writer(&self, writer: Box<dyn Write + Send>) {
        *self.writer.lock() = Some(writer);
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: SessionStatus) {
        let mut st = self.state.lock();
        self.transition(&mut st, status);
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>, session_id: &str) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a closed PTY
                debug!(session = %session_id, "PTY read ended: {}", e);
                break;
            }
        }
    }
}

/// Decode `data` prefixed by any incomplete sequence held from last time,
/// holding back a trailing incomplete sequence for the next chunk.
fn decode_utf8(pending: &mut Vec<u8>, data: &[u8]) -> String {
    pending.extend_from_slice(data);
    let bytes = std::mem::take(pending);
    match std::str::from_utf8(&bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => {
            let (valid, rest) = bytes.split_at(e.valid_up_to());
            *pending = rest.to_vec();
            String::from_utf8_lossy(valid).into_owned()
        }
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

/// The reply text following the echoed input, without the trailing
/// prompt line.
fn extract_reply(text: &str, echo: &str) -> String {
    let mut body = text;
    let echo = echo.trim();
    if !echo.is_empty() {
        if let Some(pos) = body.find(echo) {
            body = &body[pos + echo.len()..];
        }
    }
    let body = match body.rfind('\n') {
        Some(pos) => &body[..pos],
        None => "",
    };
    body.trim().to_string()
}
