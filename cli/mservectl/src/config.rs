//! CLI configuration: control plane URL and the actor sent with requests.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";

fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("io", "mserve", "mserve")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Control plane URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Sent as `X-Actor-Id`; recorded as `created_by` and in audit events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            actor: None,
        }
    }
}

impl Config {
    /// Load config from disk, or return default.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(CONFIG_FILE);

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }

    fn parse(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Save config to disk and return where it went.
    pub fn save(&self) -> Result<PathBuf> {
        let dir = config_dir()?;
        fs::create_dir_all(&dir)?;

        let path = dir.join(CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(path)
    }

    /// Flags and environment take precedence over the saved file.
    pub fn with_overrides(mut self, api_url: Option<String>, actor: Option<String>) -> Self {
        if let Some(url) = api_url {
            self.api_url = url;
        }
        if actor.is_some() {
            self.actor = actor;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:8080");
        assert!(config.actor.is_none());
    }

    #[test]
    fn test_parse_fills_missing_fields() {
        let config = Config::parse(r#"{"actor": "alice"}"#).unwrap();
        assert_eq!(config.api_url, "http://localhost:8080");
        assert_eq!(config.actor.as_deref(), Some("alice"));
    }

    #[test]
    fn test_overrides_win() {
        let config = Config {
            api_url: "http://saved:8080".to_string(),
            actor: Some("saved".to_string()),
        }
        .with_overrides(Some("http://flag:9090".to_string()), None);
        assert_eq!(config.api_url, "http://flag:9090");
        assert_eq!(config.actor.as_deref(), Some("saved"));
    }
}
