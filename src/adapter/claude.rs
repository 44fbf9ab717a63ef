//! Claude Code adapter.
//!
//! Claude Code draws a full-screen TUI. The input box shows a `>` prompt
//! with a `? for shortcuts` hint when idle; permission and trust dialogs
//! are numbered menus answered with the arrow keys and Enter.

use super::{
    credential_env, detect_generic_prompt, find_url, last_line, numbered_options, tail_lines,
    Adapter, ClassifyContext, CredentialKind, Launch, StateSignal,
};
use crate::keys;
use crate::rules::AutoResponseRule;
use crate::types::{AuthMethod, AuthRequiredInfo, BlockingPromptInfo, PromptKind, SpawnConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(select login method|please run /login|invalid api key|paste code here|sign in to your anthropic|login with your claude account)",
    )
    .expect("valid claude auth regex")
});

static TRUST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)do you trust the files in this folder").expect("valid claude trust regex")
});

static PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)do you want to (proceed|make this edit|create|run|allow)[^?\n]*\?")
        .expect("valid claude permission regex")
});

static THEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)choose the text style").expect("valid claude theme regex")
});

static READY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\?\s*for shortcuts|^\s*>\s*$)").expect("valid claude ready regex")
});

/// Adapter for the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    launch: Launch,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            launch: Launch::new("claude", &[]),
        }
    }

    /// Launch a different program (and arguments) in place of `claude`.
    pub fn with_command<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch = Launch::replace(program, args);
        self
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for ClaudeAdapter {
    fn adapter_type(&self) -> &str {
        "claude"
    }

    fn display_name(&self) -> &str {
        "Claude Code"
    }

    fn command(&self) -> &str {
        &self.launch.program
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        self.launch.args.clone()
    }

    fn env(&self, config: &SpawnConfig) -> HashMap<String, String> {
        credential_env(config, &[("ANTHROPIC_API_KEY", CredentialKind::Anthropic)])
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        let recent = tail_lines(ctx.buffer, 20);

        if AUTH.is_match(&recent) {
            let url = find_url(&recent);
            let mut info = AuthRequiredInfo::new(if url.is_some() {
                AuthMethod::Browser
            } else {
                AuthMethod::CliLogin
            });
            info.url = url;
            info.instructions = Some("Complete the Claude login, then the session continues".into());
            info.prompt_snippet = Some(last_line(&recent).trim().to_string());
            return vec![StateSignal::AuthRequired(info)];
        }

        if let Some(m) = TRUST.find(&recent) {
            let mut info = BlockingPromptInfo::new(PromptKind::TrustFolder, m.as_str());
            info.options = numbered_options(&recent);
            info.suggested_response = Some("1".into());
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(m) = PERMISSION.find(&recent) {
            let mut info = BlockingPromptInfo::new(PromptKind::Permission, m.as_str());
            info.options = numbered_options(&recent);
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(m) = THEME.find(&recent) {
            let mut info = BlockingPromptInfo::new(PromptKind::Config, m.as_str());
            info.options = numbered_options(&recent);
            info.suggested_response = Some("enter".into());
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(info) = detect_generic_prompt(&recent) {
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if recent.lines().rev().take(4).any(|line| READY.is_match(line)) {
            return vec![StateSignal::Ready];
        }

        Vec::new()
    }

    fn auto_response_rules(&self) -> Vec<AutoResponseRule> {
        // First-run setup screens; answered with their defaults
        [
            AutoResponseRule::keys(r"(?i)choose the text style", ["enter"]),
            AutoResponseRule::keys(r"(?i)press enter to continue", ["enter"]),
        ]
        .into_iter()
        .filter_map(|rule| rule.ok())
        .map(|rule| rule.once().with_description("Claude first-run setup"))
        .collect()
    }

    fn format_input(&self, message: &str) -> String {
        // Multi-line input would submit at the first newline
        if message.contains('\n') {
            keys::bracketed_paste(message)
        } else {
            message.to_string()
        }
    }
}
