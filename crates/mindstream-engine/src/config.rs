use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Per-session bounds on retained memory. Oldest events go first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_events: usize,
    pub max_bytes: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 512,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Engine settings. Every field has a default, so a partial JSON file is valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sender name for the agent's own events.
    pub agent_name: String,
    /// System template handed to the aggregator. Empty means none.
    pub template: String,
    pub max_turns: u32,
    /// Buffer between the async producer and the caller.
    pub channel_capacity: usize,
    pub memory: RetentionPolicy,
    pub plugin_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_name: "mindstream".into(),
            template: String::new(),
            max_turns: 10,
            channel_capacity: 1,
            memory: RetentionPolicy::default(),
            plugin_timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.agent_name.trim().is_empty() {
            return Err(EngineError::Config("agent_name must not be empty".into()));
        }
        if self.max_turns == 0 {
            return Err(EngineError::Config("max_turns must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(EngineError::Config("channel_capacity must be at least 1".into()));
        }
        if self.memory.max_events == 0 {
            return Err(EngineError::Config("memory.max_events must be at least 1".into()));
        }
        Ok(())
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    pub fn template(&self) -> Option<&str> {
        Some(self.template.as_str()).filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.agent_name, "mindstream");
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.memory.max_events, 512);
        assert_eq!(config.memory.max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.plugin_timeout(), Duration::from_secs(120));
        assert_eq!(config.template(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_turns": 3, "memory": {"max_events": 8}}"#).unwrap();
        assert_eq!(config.max_turns, 3);
        assert_eq!(config.memory.max_events, 8);
        assert_eq!(config.memory.max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.agent_name, "mindstream");
    }

    #[test]
    fn validation_rejects_zero_limits() {
        let config = EngineConfig {
            max_turns: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            agent_name: " ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_path_reads_and_validates() {
        let dir = std::env::temp_dir().join(format!("mindstream-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.json");
        std::fs::write(&good, r#"{"agent_name": "searcher", "template": "be helpful"}"#).unwrap();
        let config = EngineConfig::from_path(&good).unwrap();
        assert_eq!(config.agent_name, "searcher");
        assert_eq!(config.template(), Some("be helpful"));

        let bad = dir.join("bad.json");
        std::fs::write(&bad, r#"{"max_turns": 0}"#).unwrap();
        assert!(EngineConfig::from_path(&bad).is_err());

        assert!(EngineConfig::from_path(dir.join("missing.json")).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
