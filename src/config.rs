// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration stored at `~/.weenus/config.json`.
//!
//! A missing file means defaults; unknown keys are ignored and missing keys
//! take their default, so older files keep loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_SETTLE_DELAY;
use crate::ollama::{ChatOptions, DEFAULT_OLLAMA_URL};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the Ollama server
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    /// Model used by `chat` when none is given
    #[serde(default)]
    pub default_model: Option<String>,
    /// Pause between queued downloads, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// tracing level when `--verbose` is not given
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Keep the text of a stopped response in the conversation
    #[serde(default = "default_keep_partial_responses")]
    pub keep_partial_responses: bool,
    /// Sampling options sent with every chat; `chat` flags override them
    #[serde(default, skip_serializing_if = "ChatOptions::is_empty")]
    pub chat_options: ChatOptions,
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY.as_millis() as u64
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_keep_partial_responses() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ollama_url: default_ollama_url(),
            default_model: None,
            settle_delay_ms: default_settle_delay_ms(),
            log_level: default_log_level(),
            keep_partial_responses: default_keep_partial_responses(),
            chat_options: ChatOptions::default(),
        }
    }
}

/// `~/.weenus`, created if missing.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".weenus");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
    }
    Ok(dir)
}

impl AppConfig {
    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_dir()?.join(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Change the Ollama URL. Only http and https URLs are accepted.
    pub fn set_ollama_url(&mut self, url: &str) -> Result<()> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("Ollama URL must start with http:// or https:// (got '{}')", url);
        }
        self.ollama_url = url.trim_end_matches('/').to_string();
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Parsed `log_level`; unrecognised values fall back to WARN.
    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::WARN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
        assert!(config.keep_partial_responses);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.set_ollama_url("http://gpu-box:11434/").unwrap();
        config.default_model = Some("qwen2.5-coder:7b".into());
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.ollama_url, "http://gpu-box:11434");
        assert_eq!(loaded.default_model.as_deref(), Some("qwen2.5-coder:7b"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"log_level":"debug","legacy_key":1}"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.settle_delay_ms, 500);
        assert_eq!(config.ollama_url, DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_set_url_rejects_non_http() {
        let mut config = AppConfig::default();
        assert!(config.set_ollama_url("localhost:11434").is_err());
        assert_eq!(config.ollama_url, DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn test_unknown_log_level_falls_back() {
        let config = AppConfig {
            log_level: "chatty".into(),
            ..AppConfig::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_chat_options_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r####"{"chat_options":{"temperature":0.25,"stop":["###"]}}"####).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.chat_options.temperature, Some(0.25));
        assert_eq!(config.chat_options.stop, vec!["###".to_string()]);
        assert_eq!(config.chat_options.top_k, None);

        // Empty options are not written out.
        AppConfig::default().save_to(&path).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("chat_options"));
    }
}
