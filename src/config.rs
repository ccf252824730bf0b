//! Configuration for the emulator process.
//!
//! Scripts are normally loaded at runtime through `/_emulator/script`; the
//! configuration file only covers the listener, authentication, global
//! settings and an optional script preloaded into every new session.

use crate::script::{Script, ScriptDefinition};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration for the emulator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Script installed for every token that has not loaded one yet
    #[serde(default)]
    pub preload: Option<ScriptDefinition>,
}

impl EmulatorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.listen_addr()?;

        if self.auth.api_keys.iter().any(|k| k.trim().is_empty()) {
            anyhow::bail!("auth.api_keys: keys cannot be empty");
        }

        if self.settings.default_chat_model.is_empty()
            || self.settings.default_completion_model.is_empty()
        {
            anyhow::bail!("settings: default model names cannot be empty");
        }

        self.preload_script()?;
        Ok(())
    }

    /// Compile the preload script, if any.
    pub fn preload_script(&self) -> anyhow::Result<Option<Script>> {
        self.preload
            .as_ref()
            .map(|def| Script::compile(def).map_err(|e| anyhow::anyhow!("preload: {}", e)))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Socket address to bind
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ServerSettings {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| anyhow::anyhow!("server.listen `{}`: {}", self.listen, e))
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    /// Accepted bearer tokens (empty = any non-empty token)
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log matched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Serve `GET /_emulator/state`
    #[serde(default)]
    pub debug_state: bool,

    /// Pause between streamed events
    #[serde(default)]
    pub stream_chunk_delay_ms: u64,

    /// Model reported when a chat request names none
    #[serde(default = "default_chat_model")]
    pub default_chat_model: String,

    /// Model reported when a completion request names none
    #[serde(default = "default_completion_model")]
    pub default_completion_model: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            debug_state: false,
            stream_chunk_delay_ms: 0,
            default_chat_model: default_chat_model(),
            default_completion_model: default_completion_model(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_chat_model() -> String {
    "gpt-4".to_string()
}

fn default_completion_model() -> String {
    "gpt-3.5-turbo-instruct".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EmulatorConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert!(config.auth.api_keys.is_empty());
        assert!(config.settings.log_matches);
        assert!(!config.settings.debug_state);
        assert_eq!(config.settings.default_chat_model, "gpt-4");
        assert!(config.preload.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9000
auth:
  api_keys: [sk-test-1, sk-test-2]
settings:
  log_matches: false
  debug_state: true
  stream_chunk_delay_ms: 25
  default_chat_model: gpt-4o
preload:
  responses:
    - Hello from preload
    - match: help
      response: How can I help?
  defaults:
    on_unmatched: default
    content: fallback
"#;

        let config = EmulatorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.auth.api_keys.len(), 2);
        assert!(!config.settings.log_matches);
        assert!(config.settings.log_unmatched);
        assert_eq!(config.settings.stream_chunk_delay_ms, 25);
        assert_eq!(config.settings.default_completion_model, "gpt-3.5-turbo-instruct");

        let script = config.preload_script().unwrap().unwrap();
        assert_eq!(script.response_count(), 2);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(EmulatorConfig::from_yaml("settings:\n  passthrough: true\n").is_err());
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = EmulatorConfig::from_yaml("server:\n  listen: not-an-address\n").unwrap_err();
        assert!(err.to_string().contains("server.listen"));
    }

    #[test]
    fn test_invalid_preload_is_rejected() {
        let yaml = r#"
preload:
  responses:
    "(unclosed": "x"
"#;
        let err = EmulatorConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().starts_with("preload:"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auth:\n  api_keys: [sk-file]").unwrap();

        let config = EmulatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.auth.api_keys, ["sk-file"]);
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config = EmulatorConfig::from_yaml(include_str!("../config/emulator.yaml")).unwrap();
        assert!(config.preload.is_some());
    }
}
