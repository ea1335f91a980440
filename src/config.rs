//! Runtime configuration
//!
//! Settings live in ~/.config/patchsmith/config.json; the OpenRouter API key
//! comes from the OPENROUTER_API_KEY environment variable or the config file,
//! with the environment taking precedence.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_max_retries() -> u32 {
    3
}

fn default_context_lines() -> usize {
    5
}

fn default_concurrency() -> usize {
    4
}

fn default_llm_concurrency() -> usize {
    2
}

fn default_trace() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub openrouter_api_key: Option<String>,
    /// Attempts per goal pursuit before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Source lines before/after a finding in prompts.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    /// Concurrent pursuits across distinct files.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// In-flight model calls across all pursuits.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    /// Persist attempt traces under .patchsmith/traces/.
    #[serde(default = "default_trace")]
    pub trace: bool,
    /// Optional wall-clock bound per pursuit, in seconds.
    pub goal_timeout_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            max_retries: default_max_retries(),
            context_lines: default_context_lines(),
            concurrency: default_concurrency(),
            llm_concurrency: default_llm_concurrency(),
            trace: default_trace(),
            goal_timeout_secs: None,
        }
    }
}

impl RunConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchsmith").join("config.json"))
    }

    /// Load config from disk, or return defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        eprintln!(
                            "  Warning: config file {} is invalid ({}); using defaults",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// The OpenRouter API key (environment variable wins over the file).
    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        self.openrouter_api_key.clone()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    pub fn goal_timeout(&self) -> Option<std::time::Duration> {
        self.goal_timeout_secs.map(std::time::Duration::from_secs)
    }
}
