//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::{AdapterRegistry, PatternAdapter};
use crate::rules::AutoResponseRule;
use crate::{Error, Result};

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Lines kept in each session's output log
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,

    /// Default deadline for `stop`
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Deadline used by `shutdown`
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Capacity of the public event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Lines of normalized output kept as classifier context
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Default terminal geometry
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Stall detection defaults
    #[serde(default)]
    pub stall: StallConfig,

    /// Extra adapters declared in configuration
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

fn default_max_log_lines() -> usize {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    3000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_context_lines() -> usize {
    200
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_log_lines: default_max_log_lines(),
            stop_timeout_ms: default_stop_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            event_capacity: default_event_capacity(),
            context_lines: default_context_lines(),
            terminal: TerminalConfig::default(),
            stall: StallConfig::default(),
            adapters: AdaptersConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .muster/config.toml in current directory
            let local = PathBuf::from(".muster/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.muster/config.toml
            dirs::home_dir().map(|h| h.join(".muster/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                tracing::debug!("Loading config from {}", p.display());
                let content = std::fs::read_to_string(&p)?;
                Self::from_toml_str(&content)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Self::default()),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_log_lines == 0 {
            return Err(Error::Config("max_log_lines must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".into()));
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(Error::Config("terminal size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Built-in adapters plus every pattern adapter declared here
    pub fn adapter_registry(&self) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::with_defaults();
        for def in &self.adapters.patterns {
            registry.register(std::sync::Arc::new(PatternAdapter::from_config(def)?));
        }
        Ok(registry)
    }
}

/// Terminal geometry
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_rows() -> u16 {
    40
}

fn default_cols() -> u16 {
    120
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// Stall detection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stall_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_stall_timeout_ms(),
        }
    }
}

/// Adapters declared in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub patterns: Vec<PatternAdapterConfig>,
}

/// A regex-driven adapter for a tool without a built-in adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternAdapterConfig {
    /// Adapter type key
    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Command line, split with shell quoting rules
    pub command: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Patterns meaning the tool is idle and waiting for input
    #[serde(default)]
    pub ready: Vec<String>,

    /// Patterns meaning the tool wants the user to log in
    #[serde(default)]
    pub auth: Vec<String>,

    /// Patterns for confirmation prompts
    #[serde(default)]
    pub prompts: Vec<String>,

    /// Patterns meaning the current task finished
    #[serde(default)]
    pub complete: Vec<String>,

    /// Patterns meaning the tool is exiting
    #[serde(default)]
    pub exit: Vec<String>,

    /// Default auto-response rules for this adapter
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// An auto-response rule as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,

    /// Text answered followed by Enter
    #[serde(default)]
    pub response: Option<String>,

    /// Named keys answered as-is
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub once: bool,
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<AutoResponseRule> {
        let mut rule = match (&self.response, self.keys.is_empty()) {
            (Some(text), true) => AutoResponseRule::text(&self.pattern, text.clone())?,
            (None, false) => AutoResponseRule::keys(&self.pattern, self.keys.clone())?,
            _ => {
                return Err(Error::Config(format!(
                    "Rule '{}' needs exactly one of `response` or `keys`",
                    self.pattern
                )))
            }
        };
        rule.priority = self.priority;
        rule.description = self.description.clone();
        rule.consume_once = self.once;
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_log_lines, 1000);
        assert_eq!(config.stop_timeout(), Duration::from_millis(5000));
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(3000));
        assert_eq!(config.terminal.rows, 40);
        assert_eq!(config.terminal.cols, 120);
        assert!(!config.stall.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ManagerConfig::from_toml_str(
            r#"
            max_log_lines = 50

            [stall]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.max_log_lines, 50);
        assert!(config.stall.enabled);
        assert_eq!(config.stall.timeout_ms, 30_000);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_rejects_zero_log_lines() {
        assert!(matches!(
            ManagerConfig::from_toml_str("max_log_lines = 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_pattern_adapters_registered() {
        let config = ManagerConfig::from_toml_str(
            r#"
            [[adapters.patterns]]
            name = "repl"
            command = "python3 -i"
            ready = ['>>> $']

            [[adapters.patterns.rules]]
            pattern = "Overwrite\\?"
            response = "y"
            priority = 1
            "#,
        )
        .unwrap();
        let registry = config.adapter_registry().unwrap();
        assert!(registry.has("repl"));
        assert!(registry.has("claude"));
        assert_eq!(registry.get("repl").unwrap().auto_response_rules().len(), 1);
    }

    #[test]
    fn test_rule_config_requires_one_response() {
        let rule = RuleConfig {
            pattern: "x".into(),
            response: Some("y".into()),
            keys: vec!["enter".into()],
            priority: None,
            description: None,
            once: false,
        };
        assert!(rule.to_rule().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stop_timeout_ms = 250").unwrap();
        let config = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.stop_timeout(), Duration::from_millis(250));

        let missing = ManagerConfig::load(Some(Path::new("/nonexistent/muster.toml")));
        assert!(missing.is_err());
    }
}
