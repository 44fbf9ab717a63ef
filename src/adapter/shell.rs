//! Plain interactive shell adapter.

use super::{detect_generic_prompt, tail_lines, Adapter, ClassifyContext, Launch, StateSignal};
use crate::types::SpawnConfig;
use once_cell::sync::Lazy;
use regex::Regex;

static PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[$#%>❯]\s?$").expect("valid shell prompt regex"));

/// Adapter running `$SHELL` (or `/bin/sh`). Ready whenever the last line
/// ends in a prompt character; exit is observed from the process itself.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    launch: Launch,
}

impl ShellAdapter {
    pub fn new() -> Self {
        let program = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Self {
            launch: Launch::new(&program, &["-i"]),
        }
    }

    pub fn with_command<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch = Launch::replace(program, args);
        self
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for ShellAdapter {
    fn adapter_type(&self) -> &str {
        "shell"
    }

    fn display_name(&self) -> &str {
        "Shell"
    }

    fn command(&self) -> &str {
        &self.launch.program
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        self.launch.args.clone()
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        if let Some(info) = detect_generic_prompt(&tail_lines(ctx.buffer, 3)) {
            return vec![StateSignal::BlockingPrompt(info)];
        }
        if !ctx.buffer.ends_with('\n') && PROMPT.is_match(ctx.buffer) {
            return vec![StateSignal::Ready];
        }
        Vec::new()
    }
}
