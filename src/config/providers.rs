//! Provider configuration types consumed by pool construction.
//!
//! These are plain data: how they are loaded (file, env, UI) is the caller's
//! concern.

use serde::{Deserialize, Serialize};

/// One inference provider: a base URL with one or more keys and models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier used in target strings (`providerId::modelId`).
    pub id: String,
    /// Human-readable name for logs.
    #[serde(default)]
    pub name: String,
    /// OpenAI-compatible API base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// API keys rotated across requests.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Models offered by this provider.
    #[serde(default)]
    pub models: Vec<ProviderModel>,
}

/// One model entry under a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModel {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Single-provider fallback used when no structured provider list is usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyProvider {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
}
