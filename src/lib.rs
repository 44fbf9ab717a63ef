//! Muster: PTY session orchestration for interactive coding agents
//!
//! Drives many long-running agent CLIs (Claude Code, Gemini, Codex, Aider,
//! plain shells) through pseudo-terminals, classifies their free-form output
//! into interaction states, answers recognized prompts automatically and
//! exposes one control surface to a higher-level orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             SessionManager              │
//! │  registry · log buffers · event fan-out │
//! │  stop deadlines · capture bridge        │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │          Session (one per agent)        │
//! │  PTY I/O → strip → classify → signals   │
//! │  auto-response rules · stall timer      │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │      Adapter (one per CLI tool)         │
//! │  launch description · classify()        │
//! └─────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod ansi;
pub mod capture;
pub mod config;
pub mod keys;
pub mod manager;
pub mod output;
pub mod pty;
pub mod rules;
pub mod session;
pub mod stall;
pub mod types;

// Re-exports for convenience
pub use adapter::{Adapter, AdapterRegistry, ClassifyContext, StateSignal};
pub use capture::{CaptureDirection, CaptureService, FeedResult, SessionCaptureSnapshot};
pub use config::ManagerConfig;
pub use manager::{DataSubscription, LogSnapshot, ManagerEvent, SessionManager, TerminalAttachment};
pub use rules::{AutoResponseRule, RuleResponse};
pub use session::{Session, SessionEvent};
pub use stall::{sanitize_for_classifier, StallAction, StallClassification, StallClassifier};
pub use types::{
    AuthRequiredInfo, BlockingPromptInfo, SessionFilter, SessionHandle, SessionMessage,
    SessionMetrics, SessionStatus, SpawnConfig, StopOptions, StopOutcome,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown adapter type '{kind}'. Registered types: [{}]", .registered.join(", "))]
    UnknownAdapter { kind: String, registered: Vec<String> },

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} cannot do that while {status}")]
    InvalidState { id: String, status: SessionStatus },

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Capture service error: {0}")]
    Capture(String),

    #[error("Stall classifier error: {0}")]
    Classifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error was caused by caller-supplied configuration
    /// (unknown adapter, duplicate id, bad config file or pattern).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnknownAdapter { .. }
                | Error::DuplicateSession(_)
                | Error::Config(_)
                | Error::InvalidPattern(_)
                | Error::Toml(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
