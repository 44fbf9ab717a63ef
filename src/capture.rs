//! Bridge to an external terminal capture service.
//!
//! The capture service keeps its own byte-exact record of each terminal and
//! runs its own state detection. The manager feeds it every chunk of input
//! and output plus lifecycle markers. Calls are queued per session and made
//! off the output path, in order; failures are logged and skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::manager::ManagerEvent;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    Stdout,
    Stderr,
    Stdin,
}

impl std::fmt::Display for CaptureDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptureDirection::Stdout => "stdout",
            CaptureDirection::Stderr => "stderr",
            CaptureDirection::Stdin => "stdin",
        };
        write!(f, "{}", s)
    }
}

/// Options for opening a capture session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub max_lines: Option<usize>,
    pub max_bytes: Option<usize>,
    /// Adapter type of the captured session
    pub adapter_type: Option<String>,
}

/// Interaction state as seen by the capture service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureState {
    pub state: String,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub normalized_tail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTransition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub rule_id: Option<String>,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedResult {
    pub state_changed: bool,
    pub state: CaptureState,
    #[serde(default)]
    pub transition: Option<CaptureTransition>,
}

/// Point-in-time view of a captured terminal. Opaque to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCaptureSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub state: Option<CaptureState>,
    /// Rendered screen or recorded lines
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub total_bytes: u64,
}

/// Published when the capture service reports a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionStateChangedInfo {
    pub session_id: String,
    pub state: String,
    pub rule_id: Option<String>,
    pub confidence: Option<f64>,
    pub normalized_tail: String,
    pub transition: Option<CaptureTransition>,
}

impl InteractionStateChangedInfo {
    fn from_feed(session_id: &str, result: FeedResult) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: result.state.state,
            rule_id: result.state.rule_id,
            confidence: result.state.confidence,
            normalized_tail: result.state.normalized_tail,
            transition: result.transition,
        }
    }
}

/// External terminal capture service.
#[async_trait]
pub trait CaptureService: Send + Sync {
    async fn open_session(&self, session_id: &str, options: CaptureOptions) -> Result<()>;

    async fn feed(
        &self,
        session_id: &str,
        chunk: &str,
        direction: CaptureDirection,
    ) -> Result<FeedResult>;

    async fn lifecycle(&self, session_id: &str, event: &str, detail: Option<&str>) -> Result<()>;

    async fn snapshot(&self, session_id: &str) -> Result<Option<SessionCaptureSnapshot>>;
}

#[derive(Debug)]
enum CaptureOp {
    Feed {
        chunk: String,
        direction: CaptureDirection,
    },
    Lifecycle {
        event: String,
        detail: Option<String>,
    },
}

/// Ordered, non-blocking feed into the capture service for one session.
///
/// Dropping the bridge lets the worker finish what is queued and exit.
#[derive(Debug, Clone)]
pub(crate) struct CaptureBridge {
    tx: mpsc::UnboundedSender<CaptureOp>,
}

impl CaptureBridge {
    pub fn spawn(
        service: Arc<dyn CaptureService>,
        session_id: String,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CaptureOp>();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    CaptureOp::Feed { chunk, direction } => {
                        match service.feed(&session_id, &chunk, direction).await {
                            Ok(result) if result.state_changed => {
                                let info = InteractionStateChangedInfo::from_feed(&session_id, result);
                                debug!(session = %session_id, state = %info.state, "Capture state changed");
                                let _ = events.send(ManagerEvent::InteractionStateChanged(info));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(session = %session_id, %direction, "Capture feed failed: {}", e)
                            }
                        }
                    }
                    CaptureOp::Lifecycle { event, detail } => {
                        if let Err(e) = service.lifecycle(&session_id, &event, detail.as_deref()).await {
                            warn!(session = %session_id, %event, "Capture lifecycle failed: {}", e);
                        }
                    }
                }
            }
            debug!(session = %session_id, "Capture bridge closed");
        });

        Self { tx }
    }

    pub fn feed(&self, chunk: &str, direction: CaptureDirection) {
        let _ = self.tx.send(CaptureOp::Feed {
            chunk: chunk.to_string(),
            direction,
        });
    }

    pub fn lifecycle(&self, event: &str, detail: Option<String>) {
        let _ = self.tx.send(CaptureOp::Lifecycle {
            event: event.to_string(),
            detail,
        });
    }
}
