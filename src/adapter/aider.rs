//! Aider adapter.
//!
//! Aider is a line-oriented REPL: it prints a `> ` prompt (prefixed with the
//! chat mode, e.g. `architect> `, outside the default mode) when it wants
//! input, and asks confirmations as `(Y)es/(N)o ... [Yes]:`.

use super::{
    credential_env, detect_generic_prompt, last_line, tail_lines, Adapter, ClassifyContext,
    CredentialKind, Launch, StateSignal,
};
use crate::types::{AuthMethod, AuthRequiredInfo, BlockingPromptInfo, PromptKind, SpawnConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static READY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\n)(?:[\w-]+\s?)?> ?$").expect("valid aider ready regex")
});

static CONFIRM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.*?\?)?\s*\(y\)es/\(n\)o[^\[]*\[(yes|no)\]:\s*$").expect("valid aider confirm regex")
});

static AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(no (llm )?api key|api key .*not (set|found)|login to openrouter)")
        .expect("valid aider auth regex")
});

/// Adapter for the `aider` pair-programming CLI.
#[derive(Debug, Clone)]
pub struct AiderAdapter {
    launch: Launch,
}

impl AiderAdapter {
    pub fn new() -> Self {
        Self {
            launch: Launch::new("aider", &["--no-pretty", "--no-fancy-input"]),
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

impl Default for AiderAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for AiderAdapter {
    fn adapter_type(&self) -> &str {
        "aider"
    }

    fn display_name(&self) -> &str {
        "Aider"
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
                ("ANTHROPIC_API_KEY", CredentialKind::Anthropic),
                ("OPENAI_API_KEY", CredentialKind::OpenAi),
                ("GEMINI_API_KEY", CredentialKind::Google),
            ],
        )
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        let recent = tail_lines(ctx.buffer, 10);

        if AUTH.is_match(&recent) {
            let mut info = AuthRequiredInfo::new(AuthMethod::ApiKey);
            info.instructions = Some("Provide an API key for the configured model".into());
            info.prompt_snippet = Some(last_line(&recent).trim().to_string());
            return vec![StateSignal::AuthRequired(info)];
        }

        let line = last_line(ctx.buffer).trim();
        if let Some(caps) = CONFIRM.captures(line) {
            let mut info = BlockingPromptInfo::new(PromptKind::Confirmation, line);
            info.options = vec!["y".into(), "n".into()];
            info.suggested_response = caps
                .get(2)
                .map(|m| m.as_str()[..1].to_lowercase());
            return vec![StateSignal::BlockingPrompt(info)];
        }

        if let Some(info) = detect_generic_prompt(&recent) {
            return vec![StateSignal::BlockingPrompt(info)];
        }

        // The prompt is an unterminated last line
        if READY.is_match(ctx.buffer.trim_end_matches('\n')) && !ctx.buffer.ends_with('\n') {
            return vec![StateSignal::Ready];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;

    fn classify(buffer: &str) -> Vec<StateSignal> {
        let ctx = ClassifyContext {
            buffer,
            status: SessionStatus::Starting,
        };
        AiderAdapter::new().classify(buffer, &ctx)
    }

    #[test]
    fn test_prompt_is_ready() {
        assert_eq!(classify("Aider v0.50.0\nModel: gpt-4o\n> "), vec![StateSignal::Ready]);
        assert_eq!(classify("architect> "), vec![StateSignal::Ready]);
    }

    #[test]
    fn test_quoted_prompt_in_output_is_not_ready() {
        assert!(classify("> quoted line\nmore text\n").is_empty());
    }

    #[test]
    fn test_confirmation() {
        let signals = classify("Add src/main.rs to the chat? (Y)es/(N)o/(D)on't ask again [Yes]: ");
        match &signals[..] {
            [StateSignal::BlockingPrompt(info)] => {
                assert_eq!(info.prompt_type, PromptKind::Confirmation);
                assert_eq!(info.suggested_response.as_deref(), Some("y"));
            }
            other => panic!("unexpected signals: {:?}", other),
        }
    }

    #[test]
    fn test_default_args_replaced_by_with_command() {
        let config = SpawnConfig::new("a", "aider");
        assert_eq!(AiderAdapter::new().args(&config), vec!["--no-pretty", "--no-fancy-input"]);
        let custom = AiderAdapter::new().with_command("/bin/sh", ["-c", "exec cat"]);
        assert_eq!(custom.command(), "/bin/sh");
        assert_eq!(custom.args(&config), vec!["-c", "exec cat"]);
    }
}
