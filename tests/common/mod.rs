//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use muster::adapter::detect_generic_prompt;
use muster::{
    Adapter, AutoResponseRule, ClassifyContext, ManagerConfig, ManagerEvent, SessionManager,
    SessionStatus, SpawnConfig, StateSignal,
};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

/// Runs a `/bin/sh -c` script. `READY>` at the end of the output means
/// ready; `(y/n)` lines are blocking prompts.
pub struct ScriptAdapter {
    kind: String,
    script: String,
    rules: Vec<AutoResponseRule>,
}

impl ScriptAdapter {
    pub fn new(kind: &str, script: &str) -> Self {
        Self {
            kind: kind.to_string(),
            script: script.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: AutoResponseRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Adapter for ScriptAdapter {
    fn adapter_type(&self) -> &str {
        &self.kind
    }

    fn display_name(&self) -> &str {
        "Script"
    }

    fn command(&self) -> &str {
        "/bin/sh"
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        vec!["-c".to_string(), self.script.clone()]
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        if let Some(info) = detect_generic_prompt(ctx.buffer) {
            return vec![StateSignal::BlockingPrompt(info)];
        }
        if ctx.buffer.trim_end().ends_with("READY>") {
            return vec![StateSignal::Ready];
        }
        Vec::new()
    }

    fn auto_response_rules(&self) -> Vec<AutoResponseRule> {
        self.rules.clone()
    }
}

/// Manager with one script adapter registered as `kind`.
pub fn manager_with(kind: &str, script: &str) -> SessionManager {
    let manager = SessionManager::new(ManagerConfig::default());
    manager.register_adapter(Arc::new(ScriptAdapter::new(kind, script)));
    manager
}

pub fn spawn_config(id: &str, kind: &str) -> SpawnConfig {
    SpawnConfig::new(id, kind).with_id(id)
}

/// Wait for the first event matching `pred`.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<ManagerEvent>, pred: F) -> ManagerEvent
where
    F: Fn(&ManagerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until the session reaches `status`.
pub async fn wait_for_status(manager: &SessionManager, id: &str, status: SessionStatus) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if manager.get(id).map(|h| h.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll until the session log contains `needle`.
pub async fn wait_for_log(manager: &SessionManager, id: &str, needle: &str) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Ok(logs) = manager.logs(id, None) {
            if logs.iter().any(|line| line.contains(needle)) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
