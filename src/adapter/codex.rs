//! OpenAI Codex CLI adapter.

use super::{
    credential_env, detect_generic_prompt, find_url, last_line, numbered_options, tail_lines,
    Adapter, ClassifyContext, CredentialKind, Launch, StateSignal,
};
use crate::rules::AutoResponseRule;
use crate::types::{AuthMethod, AuthRequiredInfo, BlockingPromptInfo, PromptKind, SpawnConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sign in with chatgpt|provide your own api key|openai_api_key (is )?not set)")
        .expect("valid codex auth regex")
});

static PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(would you like to run the following command\?|allow command\?|would you like to make the following edits\?)",
    )
    .expect("valid codex permission regex")
});

static TRUST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(allow codex to work in this folder|do you trust the contents of this directory)")
        .expect("valid codex trust regex")
});

static UPDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)update available!?").expect("valid codex update regex"));

static READY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(send a message|ctrl\s*\+\s*j for newline|to get started, describe a task)")
        .expect("valid codex ready regex")
});

/// Adapter for the `codex` CLI.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    launch: Launch,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            launch: Launch::new("codex", &[]),
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

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for CodexAdapter {
    fn adapter_type(&self) -> &str {
        "codex"
    }

    fn display_name(&self) -> &str {
        "OpenAI Codex"
    }

    fn command(&self) -> &str {
        &self.launch.program
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        self.launch.args.clone()
    }

    fn env(&self, config: &SpawnConfig) -> HashMap<String, String> {
        credential_env(config, &[("OPENAI_API_KEY", CredentialKind::OpenAi)])
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        let recent = tail_lines(ctx.buffer, 20);

        if AUTH.is_match(&recent) {
            let url = find_url(&recent);
            let method = if url.is_some() {
                AuthMethod::Browser
            } else {
                AuthMethod::ApiKey
            };
            let mut info = AuthRequiredInfo::new(method);
            info.url = url;
            info.instructions = Some("Sign in with ChatGPT or set OPENAI_API_KEY".into());
            info.prompt_snippet = Some(last_line(&recent).trim().to_string());
            return vec![StateSignal::AuthRequired(info)];
        }

        let blocking = [
            (&*TRUST, PromptKind::TrustFolder),
            (&*PERMISSION, PromptKind::Permission),
            (&*UPDATE, PromptKind::Update),
        ];
        for (re, kind) in blocking {
            if let Some(m) = re.find(&recent) {
                let mut info = BlockingPromptInfo::new(kind, m.as_str());
                info.options = numbered_options(&recent);
                return vec![StateSignal::BlockingPrompt(info)];
            }
        }

        if let Some(info) = detect_generic_prompt(&recent) {
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if READY.is_match(&tail_lines(&recent, 5)) {
            return vec![StateSignal::Ready];
        }

        Vec::new()
    }

    fn auto_response_rules(&self) -> Vec<AutoResponseRule> {
        // Skip the self-update offer; the session would restart mid-task
        AutoResponseRule::keys(r"(?i)update available", ["down", "enter"])
            .map(|rule| vec![rule.once().with_description("Skip Codex update")])
            .unwrap_or_default()
    }
}
