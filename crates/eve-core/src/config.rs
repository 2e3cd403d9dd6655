use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default conversation windowing gap: 3 hours, in seconds.
pub const DEFAULT_GAP_SECONDS: i64 = 10_800;
pub const DEFAULT_QUEUE_LEASE_TTL_SECONDS: u64 = 120;
pub const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 8;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 100;

/// Top-level configuration: `config.json` merged with `EVE_*` environment overrides.
///
/// Layering order (lowest to highest precedence): struct defaults, `config.json`
/// under `app_dir`, then `EVE_`-prefixed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EveConfig {
    #[serde(default = "default_app_dir")]
    pub app_dir: String,

    #[serde(default)]
    pub provider_api_key: String,

    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Cap on messages included per analysis prompt. 0 = unlimited.
    #[serde(default)]
    pub analysis_max_messages: usize,
    #[serde(default = "default_max_output_tokens")]
    pub analysis_max_output_tokens: u32,

    /// Target requests/minute per operation type. 0 = auto (adaptive).
    #[serde(default)]
    pub analysis_rpm: u32,
    #[serde(default)]
    pub embed_rpm: u32,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency_analysis: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency_embedding: usize,

    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    #[serde(default = "default_gap_seconds")]
    pub conversation_gap_seconds: i64,

    #[serde(default = "default_lease_ttl")]
    pub queue_lease_ttl_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub queue_max_attempts: u32,
}

impl Default for EveConfig {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            provider_api_key: String::new(),
            analysis_model: default_analysis_model(),
            embed_model: default_embed_model(),
            analysis_max_messages: 0,
            analysis_max_output_tokens: default_max_output_tokens(),
            analysis_rpm: 0,
            embed_rpm: 0,
            worker_concurrency_analysis: default_worker_concurrency(),
            worker_concurrency_embedding: default_worker_concurrency(),
            embed_batch_size: default_embed_batch_size(),
            conversation_gap_seconds: default_gap_seconds(),
            queue_lease_ttl_seconds: default_lease_ttl(),
            queue_max_attempts: default_max_attempts(),
        }
    }
}

fn default_app_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.eve")
}
fn default_analysis_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-004".to_string()
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_embed_batch_size() -> usize {
    DEFAULT_EMBED_BATCH_SIZE
}
fn default_gap_seconds() -> i64 {
    DEFAULT_GAP_SECONDS
}
fn default_lease_ttl() -> u64 {
    DEFAULT_QUEUE_LEASE_TTL_SECONDS
}
fn default_max_attempts() -> u32 {
    DEFAULT_QUEUE_MAX_ATTEMPTS
}

impl EveConfig {
    /// Load configuration: defaults, then `<app_dir>/config.json` if present,
    /// then `EVE_*` environment variable overrides.
    ///
    /// `app_dir` must be resolved before the file merge, so it is read once
    /// up front from `EVE_APP_DIR` (or the default) and is itself still
    /// overridable by the final env pass.
    pub fn load() -> Result<Self> {
        let app_dir = std::env::var("EVE_APP_DIR").unwrap_or_else(|_| default_app_dir());
        let config_path = format!("{app_dir}/config.json");

        let config: EveConfig = Figment::from(figment::providers::Serialized::defaults(
            EveConfig::default(),
        ))
        .merge(Json::file(&config_path))
        .merge(Env::prefixed("EVE_"))
        .extract()
        .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn warehouse_path(&self) -> String {
        format!("{}/eve.db", self.app_dir)
    }

    pub fn queue_path(&self) -> String {
        format!("{}/eve-queue.db", self.app_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = EveConfig::default();
        assert_eq!(cfg.conversation_gap_seconds, 10_800);
        assert_eq!(cfg.queue_max_attempts, 8);
        assert!(cfg.warehouse_path().ends_with("/eve.db"));
        assert!(cfg.queue_path().ends_with("/eve-queue.db"));
    }
}
