//! Auto-response rules: regex patterns matched against detected prompts.
//!
//! Each session owns a [`RuleSet`]: its own rules, ordered by priority, and
//! the defaults contributed by its adapter. Session rules are always
//! consulted first and the first match wins.

use crate::keys;
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Function producing a response from the captures of a matched prompt.
pub type DynamicResponse = Arc<dyn Fn(&Captures<'_>) -> String + Send + Sync>;

/// What to write when a rule fires.
#[derive(Clone)]
pub enum RuleResponse {
    /// Literal text, followed by Enter
    Text(String),
    /// Named keys (see [`keys::encode`]); no implicit Enter
    Keys(Vec<String>),
    /// Text computed from the match, followed by Enter
    Dynamic(DynamicResponse),
}

impl fmt::Debug for RuleResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleResponse::Text(text) => f.debug_tuple("Text").field(text).finish(),
            RuleResponse::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            RuleResponse::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

impl RuleResponse {
    /// Bytes to write to the terminal for this response.
    pub fn render(&self, captures: &Captures<'_>) -> crate::Result<String> {
        match self {
            RuleResponse::Text(text) => Ok(format!("{}\r", text)),
            RuleResponse::Keys(names) => keys::encode_all(names),
            RuleResponse::Dynamic(f) => Ok(format!("{}\r", f(captures))),
        }
    }

    /// Short human-readable form for events and logs.
    pub fn describe(&self) -> String {
        match self {
            RuleResponse::Text(text) => text.clone(),
            RuleResponse::Keys(keys) => format!("[{}]", keys.join(" ")),
            RuleResponse::Dynamic(_) => "<dynamic>".to_string(),
        }
    }
}

/// A (pattern, response) pair consulted when a blocking prompt is detected.
#[derive(Debug, Clone)]
pub struct AutoResponseRule {
    pub pattern: Regex,
    pub response: RuleResponse,
    /// Lower numbers are consulted first; unprioritized rules come last
    pub priority: Option<i32>,
    pub description: Option<String>,
    /// Remove the rule after it fires once
    pub consume_once: bool,
}

impl AutoResponseRule {
    pub fn new(pattern: &str, response: RuleResponse) -> crate::Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            response,
            priority: None,
            description: None,
            consume_once: false,
        })
    }

    /// Rule answering with `text` followed by Enter.
    pub fn text(pattern: &str, text: impl Into<String>) -> crate::Result<Self> {
        Self::new(pattern, RuleResponse::Text(text.into()))
    }

    /// Rule answering with a sequence of named keys. Key names are
    /// validated up front.
    pub fn keys<S: Into<String>>(
        pattern: &str,
        names: impl IntoIterator<Item = S>,
    ) -> crate::Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        keys::encode_all(&names)?;
        Self::new(pattern, RuleResponse::Keys(names))
    }

    pub fn dynamic<F>(pattern: &str, f: F) -> crate::Result<Self>
    where
        F: Fn(&Captures<'_>) -> String + Send + Sync + 'static,
    {
        Self::new(pattern, RuleResponse::Dynamic(Arc::new(f)))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.consume_once = true;
        self
    }

    /// Source text of the pattern; the key used by [`RuleSet::remove`].
    pub fn pattern_source(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Where a fired rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    Session,
    Adapter,
}

/// Result of a successful rule evaluation.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub origin: RuleOrigin,
    pub pattern: String,
    pub description: Option<String>,
    /// Rendered bytes to write to the terminal
    pub input: String,
    /// Human-readable form of the response
    pub response: String,
}

/// Per-session rule list plus the adapter defaults.
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Kept sorted by priority; ties stay in insertion order
    rules: Vec<AutoResponseRule>,
    defaults: Vec<AutoResponseRule>,
    consumed_defaults: HashSet<usize>,
}

impl RuleSet {
    pub fn new(defaults: Vec<AutoResponseRule>) -> Self {
        let mut defaults = defaults;
        sort_rules(&mut defaults);
        Self {
            rules: Vec::new(),
            defaults,
            consumed_defaults: HashSet::new(),
        }
    }

    pub fn add(&mut self, rule: AutoResponseRule) {
        self.rules.push(rule);
        sort_rules(&mut self.rules);
    }

    /// Remove the first session rule, in evaluation order, whose pattern
    /// source equals `pattern`.
    pub fn remove(&mut self, pattern: &str) -> bool {
        match self.rules.iter().position(|rule| rule.pattern_source() == pattern) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace all session rules.
    pub fn set(&mut self, rules: Vec<AutoResponseRule>) {
        self.rules = rules;
        sort_rules(&mut self.rules);
    }

    /// Session rules in evaluation order.
    pub fn get(&self) -> Vec<AutoResponseRule> {
        self.rules.clone()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the first rule matching `prompt` and render its response.
    ///
    /// `consume_once` session rules are removed; `consume_once` adapter
    /// defaults are disabled for the rest of this rule set's life. A rule
    /// whose response cannot be rendered is skipped.
    pub fn evaluate(&mut self, prompt: &str) -> Option<RuleMatch> {
        let mut fired = None;
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(input) = render_match(rule, prompt) {
                fired = Some((index, rule_match(rule, RuleOrigin::Session, input)));
                break;
            }
        }
        if let Some((index, matched)) = fired {
            if self.rules[index].consume_once {
                self.rules.remove(index);
            }
            return Some(matched);
        }

        for (index, rule) in self.defaults.iter().enumerate() {
            if self.consumed_defaults.contains(&index) {
                continue;
            }
            if let Some(input) = render_match(rule, prompt) {
                if rule.consume_once {
                    self.consumed_defaults.insert(index);
                }
                return Some(rule_match(rule, RuleOrigin::Adapter, input));
            }
        }

        None
    }
}

fn sort_rules(rules: &mut [AutoResponseRule]) {
    // Stable: equal priorities keep insertion order
    rules.sort_by_key(|rule| (rule.priority.is_none(), rule.priority.unwrap_or(0)));
}

fn render_match(rule: &AutoResponseRule, prompt: &str) -> Option<String> {
    let captures = rule.pattern.captures(prompt)?;
    match rule.response.render(&captures) {
        Ok(input) => Some(input),
        Err(e) => {
            tracing::warn!(pattern = %rule.pattern, "Skipping auto-response rule: {}", e);
            None
        }
    }
}

fn rule_match(rule: &AutoResponseRule, origin: RuleOrigin, input: String) -> RuleMatch {
    RuleMatch {
        origin,
        pattern: rule.pattern_source().to_string(),
        description: rule.description.clone(),
        input,
        response: rule.response.describe(),
    }
}
