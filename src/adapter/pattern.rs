//! Configuration-driven adapter.
//!
//! Describes a tool entirely through regex lists declared in TOML, for CLIs
//! that have no built-in adapter.

use super::{detect_generic_prompt, last_line, tail_lines, Adapter, ClassifyContext, StateSignal};
use crate::config::PatternAdapterConfig;
use crate::rules::AutoResponseRule;
use crate::types::{AuthMethod, AuthRequiredInfo, BlockingPromptInfo, PromptKind, SpawnConfig};
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;

/// Lines of context the pattern lists are matched against.
const MATCH_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct PatternAdapter {
    kind: String,
    display_name: String,
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    ready: Vec<Regex>,
    auth: Vec<Regex>,
    prompts: Vec<Regex>,
    complete: Vec<Regex>,
    exit: Vec<Regex>,
    rules: Vec<AutoResponseRule>,
}

impl PatternAdapter {
    pub fn from_config(config: &PatternAdapterConfig) -> Result<Self> {
        let mut words = shell_words::split(&config.command)
            .map_err(|e| Error::Config(format!("Adapter '{}': bad command: {}", config.name, e)))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| Error::Config(format!("Adapter '{}': empty command", config.name)))?;
        let program = shellexpand::tilde(&program).into_owned();

        let rules = config
            .rules
            .iter()
            .map(|rule| rule.to_rule())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind: config.name.clone(),
            display_name: config.display_name.clone().unwrap_or_else(|| config.name.clone()),
            program,
            args: words.collect(),
            env: config.env.clone(),
            ready: compile(&config.ready)?,
            auth: compile(&config.auth)?,
            prompts: compile(&config.prompts)?,
            complete: compile(&config.complete)?,
            exit: compile(&config.exit)?,
            rules,
        })
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Error::from))
        .collect()
}

fn first_match<'t>(patterns: &[Regex], text: &'t str) -> Option<regex::Match<'t>> {
    patterns.iter().find_map(|re| re.find(text))
}

impl Adapter for PatternAdapter {
    fn adapter_type(&self) -> &str {
        &self.kind
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn command(&self) -> &str {
        &self.program
    }

    fn args(&self, _config: &SpawnConfig) -> Vec<String> {
        self.args.clone()
    }

    fn env(&self, _config: &SpawnConfig) -> HashMap<String, String> {
        self.env.clone()
    }

    fn classify(&self, _chunk: &str, ctx: &ClassifyContext<'_>) -> Vec<StateSignal> {
        let recent = tail_lines(ctx.buffer, MATCH_WINDOW);

        if let Some(m) = first_match(&self.exit, &recent) {
            return vec![StateSignal::Exited {
                reason: m.as_str().trim().to_string(),
            }];
        }

        if first_match(&self.auth, &recent).is_some() {
            let mut info = AuthRequiredInfo::new(AuthMethod::Unknown);
            info.url = super::find_url(&recent);
            info.prompt_snippet = Some(last_line(&recent).trim().to_string());
            return vec![StateSignal::AuthRequired(info)];
        }

        if first_match(&self.prompts, &recent).is_some() {
            let line = last_line(&recent).trim();
            return vec![StateSignal::BlockingPrompt(BlockingPromptInfo::new(
                PromptKind::Unknown,
                line,
            ))];
        }

        if let Some(info) = detect_generic_prompt(&recent) {
            return vec![StateSignal::BlockingPrompt(info)];
        }

        let mut signals = Vec::new();
        if first_match(&self.complete, &recent).is_some() {
            signals.push(StateSignal::TaskComplete);
        }
        // Ready patterns see the raw tail so `$` anchors at the live prompt
        if first_match(&self.ready, ctx.buffer).is_some() {
            signals.push(StateSignal::Ready);
        }
        signals
    }

    fn auto_response_rules(&self) -> Vec<AutoResponseRule> {
        self.rules.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;

    fn config() -> PatternAdapterConfig {
        PatternAdapterConfig {
            name: "repl".into(),
            display_name: None,
            command: "~/bin/repl --color 'no thanks'".into(),
            env: HashMap::new(),
            ready: vec![r">>> $".into()],
            auth: vec![r"(?i)token required".into()],
            prompts: vec![r"(?i)overwrite\?".into()],
            complete: vec![],
            exit: vec![r"(?i)^bye$".into()],
            rules: vec![],
        }
    }

    fn classify(adapter: &PatternAdapter, buffer: &str) -> Vec<StateSignal> {
        let ctx = ClassifyContext {
            buffer,
            status: SessionStatus::Ready,
        };
        adapter.classify(buffer, &ctx)
    }

    #[test]
    fn test_command_split_and_expanded() {
        let adapter = PatternAdapter::from_config(&config()).unwrap();
        assert!(!adapter.command().starts_with('~'));
        assert!(adapter.command().ends_with("bin/repl"));
        assert_eq!(adapter.args(&SpawnConfig::default()), vec!["--color", "no thanks"]);
        assert_eq!(adapter.display_name(), "repl");
    }

    #[test]
    fn test_classification_order() {
        let adapter = PatternAdapter::from_config(&config()).unwrap();
        assert_eq!(classify(&adapter, "Python\n>>> "), vec![StateSignal::Ready]);
        assert!(matches!(
            &classify(&adapter, "file.txt exists. Overwrite?")[..],
            [StateSignal::BlockingPrompt(info)] if info.prompt == "file.txt exists. Overwrite?"
        ));
        assert!(matches!(
            &classify(&adapter, "Token required\n")[..],
            [StateSignal::AuthRequired(_)]
        ));
    }

    #[test]
    fn test_invalid_definitions() {
        let mut bad = config();
        bad.ready = vec!["(".into()];
        assert!(matches!(PatternAdapter::from_config(&bad), Err(Error::InvalidPattern(_))));

        let mut empty = config();
        empty.command = "   ".into();
        assert!(matches!(PatternAdapter::from_config(&empty), Err(Error::Config(_))));
    }
}
