//! Adapter contract and registry.
//!
//! An adapter describes how to launch one CLI tool and how to read its
//! terminal output. Adapters are stateless and shared between sessions;
//! everything a classification needs arrives through [`ClassifyContext`].

mod aider;
mod claude;
mod codex;
mod gemini;
mod pattern;
mod shell;

pub use aider::AiderAdapter;
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;
pub use pattern::PatternAdapter;
pub use shell::ShellAdapter;

use crate::rules::AutoResponseRule;
use crate::types::{AuthRequiredInfo, BlockingPromptInfo, PromptKind, SessionStatus, SpawnConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// What the session knows when it asks an adapter to classify output.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    /// Normalized output accumulated since the last state change,
    /// including the chunk being classified
    pub buffer: &'a str,
    pub status: SessionStatus,
}

/// Interaction state inferred from output.
#[derive(Debug, Clone, PartialEq)]
pub enum StateSignal {
    /// The tool is idle and waiting for input
    Ready,
    /// The tool wants the user to log in
    AuthRequired(AuthRequiredInfo),
    /// The tool is waiting for a confirmation or a choice
    BlockingPrompt(BlockingPromptInfo),
    /// The current task finished
    TaskComplete,
    /// The tool announced it is exiting
    Exited { reason: String },
}

/// Per-tool launch description and output classifier.
pub trait Adapter: Send + Sync {
    /// Registry key, e.g. `"claude"`
    fn adapter_type(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Program to run
    fn command(&self) -> &str;

    /// Arguments for the program
    fn args(&self, config: &SpawnConfig) -> Vec<String> {
        let _ = config;
        Vec::new()
    }

    /// Environment added on top of the caller's `env`; typically credentials
    fn env(&self, config: &SpawnConfig) -> HashMap<String, String> {
        let _ = config;
        HashMap::new()
    }

    /// Inspect newly arrived output and report any recognized states.
    fn classify(&self, chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal>;

    /// Rules consulted after the session's own rules
    fn auto_response_rules(&self) -> Vec<AutoResponseRule> {
        Vec::new()
    }

    /// Shape a message before it is written to the terminal.
    fn format_input(&self, message: &str) -> String {
        message.to_string()
    }
}

/// Program and arguments used to launch a built-in tool.
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub program: String,
    pub args: Vec<String>,
}

impl Launch {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn replace<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Lookup table of adapters keyed by adapter type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeAdapter::new()));
        registry.register(Arc::new(GeminiAdapter::new()));
        registry.register(Arc::new(CodexAdapter::new()));
        registry.register(Arc::new(AiderAdapter::new()));
        registry.register(Arc::new(ShellAdapter::new()));
        registry
    }

    /// Register an adapter, returning the one it replaced.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        let kind = adapter.adapter_type().to_string();
        let previous = self.adapters.insert(kind.clone(), adapter);
        if previous.is_some() {
            tracing::debug!("Replaced adapter: {}", kind);
        }
        previous
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn unregister(&mut self, kind: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.remove(kind)
    }

    /// Registered adapter types, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.adapters.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Every registered adapter, sorted by type.
    pub fn all(&self) -> Vec<Arc<dyn Adapter>> {
        self.list()
            .iter()
            .filter_map(|kind| self.adapters.get(kind).cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.adapters.clear();
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}

// Helpers shared by the built-in adapters.

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\)]+"#).expect("valid url regex"));

static YES_NO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\(y/n\)|\[y/n\]|\(yes/no\)|\[yes/no\])").expect("valid yes/no regex")
});

static PRESS_ENTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)press\s+(enter|return)\b").expect("valid press-enter regex"));

static NUMBERED_OPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[❯>›]\s*)?(\d+)[.)]\s+(.+?)\s*$").expect("valid option regex")
});

/// The last `n` lines of `buffer`, trailing blank lines ignored.
pub(crate) fn tail_lines(buffer: &str, n: usize) -> String {
    let lines: Vec<&str> = buffer.trim_end_matches(['\n', ' ']).lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// The last line of `buffer` that is not blank.
pub(crate) fn last_line(buffer: &str) -> &str {
    buffer
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
}

pub(crate) fn find_url(text: &str) -> Option<String> {
    URL.find(text).map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
}

/// Menu entries of the form `1. Yes` found in `text`.
pub(crate) fn numbered_options(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| NUMBERED_OPTION.captures(line))
        .map(|caps| format!("{}. {}", &caps[1], &caps[2]))
        .collect()
}

/// Generic confirmation prompt (`(y/n)`, `[Y/n]`, `Press Enter`) at the
/// end of the buffer, for tools without a bespoke pattern.
pub fn detect_generic_prompt(buffer: &str) -> Option<BlockingPromptInfo> {
    let line = last_line(buffer).trim();
    if line.is_empty() {
        return None;
    }

    if let Some(m) = YES_NO.find(line) {
        let mut info = BlockingPromptInfo::new(PromptKind::Confirmation, line);
        info.options = vec!["y".to_string(), "n".to_string()];
        // [Y/n] marks yes as the default
        let marker = m.as_str();
        if marker.contains('Y') && !marker.contains('N') {
            info.suggested_response = Some("y".to_string());
        } else if marker.contains('N') && !marker.contains('Y') {
            info.suggested_response = Some("n".to_string());
        }
        return Some(info);
    }

    if PRESS_ENTER.is_match(line) {
        let mut info = BlockingPromptInfo::new(PromptKind::Confirmation, line);
        info.suggested_response = Some("enter".to_string());
        info.instructions = Some("Press Enter to continue".to_string());
        return Some(info);
    }

    None
}

/// Credential environment variables shared by the built-ins.
pub(crate) fn credential_env(config: &SpawnConfig, keys: &[(&str, CredentialKind)]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let Some(credentials) = &config.credentials else {
        return env;
    };
    for (var, kind) in keys {
        let value = match kind {
            CredentialKind::Anthropic => &credentials.anthropic_api_key,
            CredentialKind::OpenAi => &credentials.openai_api_key,
            CredentialKind::Google => &credentials.google_api_key,
        };
        if let Some(value) = value {
            env.insert(var.to_string(), value.clone());
        }
    }
    env
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum CredentialKind {
    Anthropic,
    OpenAi,
    Google,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    #[test]
    fn test_registry_defaults_sorted() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["aider", "claude", "codex", "gemini", "shell"]);
        assert!(registry.has("claude"));
        assert!(registry.get("cursor").is_none());
    }

    #[test]
    fn test_register_replaces_previous() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.register(Arc::new(ShellAdapter::new())).is_none());
        let previous = registry.register(Arc::new(ShellAdapter::new().with_command("/bin/bash", ["-i"])));
        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("shell").unwrap().command(), "/bin/bash");
    }

    #[test]
    fn test_unregister_and_clear() {
        let mut registry = AdapterRegistry::with_defaults();
        assert!(registry.unregister("codex").is_some());
        assert!(registry.unregister("codex").is_none());
        assert_eq!(registry.all().len(), 4);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_generic_prompt_detection() {
        let info = detect_generic_prompt("Installing...\nContinue? [Y/n] ").unwrap();
        assert_eq!(info.prompt, "Continue? [Y/n]");
        assert_eq!(info.suggested_response.as_deref(), Some("y"));

        let info = detect_generic_prompt("Press Enter to continue").unwrap();
        assert_eq!(info.suggested_response.as_deref(), Some("enter"));

        assert!(detect_generic_prompt("all good\n").is_none());
    }

    #[test]
    fn test_helpers() {
        assert_eq!(last_line("a\nb\n\n"), "b");
        assert_eq!(tail_lines("1\n2\n3\n4\n", 2), "3\n4");
        assert_eq!(
            find_url("Open https://example.com/login?x=1. then").as_deref(),
            Some("https://example.com/login?x=1")
        );
        assert_eq!(
            numbered_options("❯ 1. Yes\n  2. No, tell Claude\n"),
            vec!["1. Yes", "2. No, tell Claude"]
        );
    }

    #[test]
    fn test_credential_env() {
        let mut config = SpawnConfig::new("a", "claude");
        config.credentials = Some(Credentials {
            anthropic_api_key: Some("sk-ant".into()),
            ..Default::default()
        });
        let env = credential_env(
            &config,
            &[("ANTHROPIC_API_KEY", CredentialKind::Anthropic), ("OPENAI_API_KEY", CredentialKind::OpenAi)],
        );
        assert_eq!(env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-ant"));
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }
}
