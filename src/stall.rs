//! Stall detection and the classifier escalation path.
//!
//! A session tracks time since its last meaningful output. When the
//! configured timeout elapses it reports a stall once and pauses until the
//! classification result (if any) is handed back, which resets the timer.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most recent characters of output given to a stall classifier.
pub const CLASSIFIER_TAIL_CHARS: usize = 1500;

/// Replacement for text that tries to steer the classifier.
pub const REDACTED: &str = "[REDACTED]";

/// Default stall timeout when detection is enabled without one.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(30_000);

static INSTRUCTION_OVERRIDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:ignore|disregard|forget)\s+(?:all\s+)?(?:the\s+)?(?:previous|above|prior)\s+(?:instructions|prompts|rules)\b",
    )
    .expect("valid instruction-override regex")
});

static ROLE_REASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:\b(?:you\s+are(?:\s+now)?|act\s+as|pretend\s+to\s+be|you\s+must)\b|\bsystem\s*:)",
    )
    .expect("valid role-reassignment regex")
});

/// What to do about a stalled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StallAction {
    /// Keep waiting
    Continue,
    /// Write this text to the session as input
    Respond(String),
    /// Gracefully terminate the session
    Terminate,
}

/// Verdict returned by a [`StallClassifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallClassification {
    pub action: StallAction,
    #[serde(default)]
    pub reason: Option<String>,
}

impl StallClassification {
    pub fn new(action: StallAction) -> Self {
        Self { action, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// External judge deciding what a stalled session needs.
///
/// Receives only sanitized output (see [`sanitize_for_classifier`]).
/// Returning `Ok(None)` means "no opinion"; errors are logged and treated
/// the same way.
#[async_trait]
pub trait StallClassifier: Send + Sync {
    async fn classify(
        &self,
        session_id: &str,
        sanitized_tail: &str,
        stall_duration: Duration,
    ) -> crate::Result<Option<StallClassification>>;
}

/// Stall settings handed to each session at spawn time.
#[derive(Clone, Default)]
pub struct StallSettings {
    pub enabled: bool,
    pub timeout: Option<Duration>,
    pub classifier: Option<Arc<dyn StallClassifier>>,
}

impl StallSettings {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_STALL_TIMEOUT)
    }
}

impl std::fmt::Debug for StallSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallSettings")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

/// Prepare recent output for an automatic classifier.
///
/// Keeps the last [`CLASSIFIER_TAIL_CHARS`] characters, replaces phrases
/// that try to override instructions or reassign the reader's role with
/// [`REDACTED`], then trims again so the result never exceeds the limit.
pub fn sanitize_for_classifier(text: &str) -> String {
    let tail = last_chars(text, CLASSIFIER_TAIL_CHARS);
    let redacted = INSTRUCTION_OVERRIDE.replace_all(&tail, REDACTED);
    let redacted = ROLE_REASSIGNMENT.replace_all(&redacted, REDACTED);
    last_chars(&redacted, CLASSIFIER_TAIL_CHARS)
}

fn last_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Timer tracking time since the last meaningful output.
#[derive(Debug)]
pub struct StallDetector {
    enabled: bool,
    timeout: Duration,
    last_activity: Instant,
    paused: bool,
}

impl StallDetector {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            timeout,
            last_activity: Instant::now(),
            paused: false,
        }
    }

    pub fn from_settings(settings: &StallSettings) -> Self {
        Self::new(settings.enabled, settings.timeout())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record meaningful output. Does not unpause a reported stall.
    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Restart the timer and resume reporting.
    pub fn reset(&mut self) {
        self.last_activity = Instant::now();
        self.paused = false;
    }

    /// Report a stall once the timeout has elapsed, then pause.
    pub fn check(&mut self) -> Option<Duration> {
        if !self.enabled || self.paused {
            return None;
        }
        let idle = self.last_activity.elapsed();
        if idle < self.timeout {
            return None;
        }
        self.paused = true;
        Some(idle)
    }
}
