//! Shared data model: spawn configuration, status, handles and prompt info.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default deadline for `SessionManager::stop`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lifecycle status of a session; also the state set of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Starting,
    Authenticating,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SessionStatus; 8] = [
        SessionStatus::Pending,
        SessionStatus::Starting,
        SessionStatus::Authenticating,
        SessionStatus::Ready,
        SessionStatus::Busy,
        SessionStatus::Stopping,
        SessionStatus::Stopped,
        SessionStatus::Error,
    ];

    /// Whether a process is (or may still be) attached to the session.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            SessionStatus::Pending | SessionStatus::Stopped | SessionStatus::Error
        )
    }

    /// Whether no further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s.to_lowercase())
            .ok_or_else(|| crate::Error::Config(format!("Unknown session status: {}", s)))
    }
}

/// API keys handed to the agent CLI through its environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub google_api_key: Option<String>,
}

/// Resource limits passed through to the runtime. Not enforced here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Limits forwarded to the capture service when a capture session is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureLimits {
    #[serde(default)]
    pub max_lines: Option<usize>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// Everything needed to create a session. Immutable once the session exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Unique id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Adapter key
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub auto_restart: Option<bool>,
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub capture: CaptureLimits,
}

impl SpawnConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Read-only projection of a session, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub role: Option<String>,
    pub capabilities: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Kind of blocking prompt detected in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Permission,
    Confirmation,
    TrustFolder,
    Config,
    ModelSelect,
    Update,
    Tos,
    Unknown,
}

/// A detected point where the tool waits for a confirmation or choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingPromptInfo {
    pub prompt_type: PromptKind,
    /// Prompt text as detected (matched by auto-response rules)
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub suggested_response: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl BlockingPromptInfo {
    pub fn new(prompt_type: PromptKind, prompt: impl Into<String>) -> Self {
        Self {
            prompt_type,
            prompt: prompt.into(),
            options: Vec::new(),
            suggested_response: None,
            instructions: None,
            url: None,
        }
    }
}

/// How the tool wants the user to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Browser,
    DeviceCode,
    ApiKey,
    CliLogin,
    Unknown,
}

/// Structured description of a detected authentication requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequiredInfo {
    pub method: AuthMethod,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub device_code: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub prompt_snippet: Option<String>,
}

impl AuthRequiredInfo {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            url: None,
            device_code: None,
            instructions: None,
            prompt_snippet: None,
        }
    }
}

/// Legacy login projection emitted alongside [`AuthRequiredInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub instructions: Option<String>,
    pub url: Option<String>,
}

impl From<&AuthRequiredInfo> for LoginInfo {
    fn from(info: &AuthRequiredInfo) -> Self {
        Self {
            instructions: info.instructions.clone(),
            url: info.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Task,
    Response,
    Question,
}

/// A message written to, or collected from, a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub direction: MessageDirection,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(
        session_id: impl Into<String>,
        direction: MessageDirection,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            direction,
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Counters describing one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub status: SessionStatus,
    #[serde(with = "duration_ms")]
    pub uptime: Duration,
    pub messages_sent: u64,
    pub output_bytes: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Query over the session registry. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Vec<SessionStatus>,
    pub kind: Vec<String>,
}

impl SessionFilter {
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status.push(status);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = SessionStatus>) -> Self {
        self.status.extend(statuses);
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind.push(kind.into());
        self
    }

    pub fn matches(&self, handle: &SessionHandle) -> bool {
        (self.status.is_empty() || self.status.contains(&handle.status))
            && (self.kind.is_empty() || self.kind.iter().any(|k| k == &handle.kind))
    }
}

/// Options for `SessionManager::stop`.
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Send SIGKILL straight away instead of SIGTERM
    pub force: bool,
    /// Deadline before escalating to a forced kill
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl StopOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

/// How a stop request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited before the deadline
    Exited,
    /// The deadline passed and the process was force-killed
    Forced,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
