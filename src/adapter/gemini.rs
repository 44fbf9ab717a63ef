//! Gemini CLI adapter.

use super::{
    credential_env, detect_generic_prompt, find_url, last_line, numbered_options, tail_lines,
    Adapter, ClassifyContext, CredentialKind, Launch, StateSignal,
};
use crate::types::{AuthMethod, AuthRequiredInfo, BlockingPromptInfo, PromptKind, SpawnConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(login with google|waiting for auth|enter the authorization code|gemini_api_key (environment variable )?(is )?not (set|found)|get started, please choose)",
    )
    .expect("valid gemini auth regex")
});

static DEVICE_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)code:\s*([A-Z0-9]{4}-[A-Z0-9]{4})").expect("valid gemini device code regex")
});

static TRUST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)do you trust this folder\??").expect("valid gemini trust regex"));

static PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(allow execution[^?\n]*\??|apply this change\?|waiting for user confirmation)")
        .expect("valid gemini permission regex")
});

static READY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)type your message").expect("valid gemini ready regex"));

static EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)agent powering down").expect("valid gemini exit regex"));

/// Adapter for Google's `gemini` CLI.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    launch: Launch,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            launch: Launch::new("gemini", &[]),
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

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for GeminiAdapter {
    fn adapter_type(&self) -> &str {
        "gemini"
    }

    fn display_name(&self) -> &str {
        "Gemini CLI"
    }

    fn command(&self) -> &str {
        &self.launch.program
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        self.launch.args.clone()
    }

    fn env(&self, config: &SpawnConfig) -> HashMap<String, String> {
        credential_env(
            config,
            &[
                ("GEMINI_API_KEY", CredentialKind::Google),
                ("GOOGLE_API_KEY", CredentialKind::Google),
            ],
        )
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        let recent = tail_lines(ctx.buffer, 20);

        if EXIT.is_match(&recent) {
            return vec![StateSignal::Exited {
                reason: "Gemini CLI shut down".into(),
            }];
        }

        if AUTH.is_match(&recent) {
            let device_code = DEVICE_CODE.captures(&recent).map(|caps| caps[1].to_string());
            let url = find_url(&recent);
            let method = if device_code.is_some() {
                AuthMethod::DeviceCode
            } else if url.is_some() {
                AuthMethod::Browser
            } else if recent.to_lowercase().contains("api_key") {
                AuthMethod::ApiKey
            } else {
                AuthMethod::Unknown
            };
            let mut info = AuthRequiredInfo::new(method);
            info.url = url;
            info.device_code = device_code;
            info.prompt_snippet = Some(last_line(&recent).trim().to_string());
            return vec![StateSignal::AuthRequired(info)];
        }

        if let Some(m) = TRUST.find(&recent) {
            let mut info = BlockingPromptInfo::new(PromptKind::TrustFolder, m.as_str());
            info.options = numbered_options(&recent);
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(m) = PERMISSION.find(&recent) {
            let mut info = BlockingPromptInfo::new(PromptKind::Permission, m.as_str());
            info.options = numbered_options(&recent);
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(info) = detect_generic_prompt(&recent) {
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if READY.is_match(&tail_lines(&recent, 5)) {
            return vec![StateSignal::Ready];
        }

        Vec::new()
    }
}
