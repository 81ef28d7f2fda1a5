//! Request pool: one entry per (provider, model, key) combination, with
//! per-target round-robin rotation.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::{LegacyProvider, ProviderConfig};

/// Target selecting the full pool.
pub const TARGET_ALL: &str = "all";

/// Pool resolution errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("No pool entries match target '{0}'")]
    EmptyTarget(String),
}

/// One concrete (provider, model, credential) combination usable for a single
/// inference attempt. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ModelPoolEntry {
    pub entry_id: Uuid,
    pub provider_id: String,
    pub provider_name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

impl ModelPoolEntry {
    /// Provider::model label used in logs and target strings.
    pub fn label(&self) -> String {
        format!("{}::{}", self.provider_id, self.model)
    }
}

/// Flattened pool of usable entries plus one round-robin cursor per target.
///
/// Construction never contacts the network. Callers are responsible for
/// treating an empty pool as a configuration error before starting a run.
#[derive(Debug, Default)]
pub struct ModelPool {
    entries: Vec<ModelPoolEntry>,
    cursors: HashMap<String, usize>,
}

impl ModelPool {
    /// Build the pool from a structured provider list, falling back to a
    /// legacy single-provider definition when the list yields nothing.
    pub fn from_providers(
        providers: &[ProviderConfig],
        legacy: Option<&LegacyProvider>,
    ) -> Self {
        let mut entries = Vec::new();

        for provider in providers {
            for model in provider.models.iter().filter(|m| m.enabled) {
                for key in &provider.api_keys {
                    entries.push(ModelPoolEntry {
                        entry_id: Uuid::new_v4(),
                        provider_id: provider.id.clone(),
                        provider_name: if provider.name.is_empty() {
                            provider.id.clone()
                        } else {
                            provider.name.clone()
                        },
                        base_url: provider.base_url.clone(),
                        model: model.id.clone(),
                        api_key: key.clone(),
                    });
                }
            }
        }

        if entries.is_empty() {
            if let Some(legacy) = legacy {
                entries.push(ModelPoolEntry {
                    entry_id: Uuid::new_v4(),
                    provider_id: "legacy".to_string(),
                    provider_name: "legacy".to_string(),
                    base_url: legacy.base_url.clone(),
                    model: legacy.model_name.clone(),
                    api_key: legacy.api_key.clone(),
                });
            }
        }

        Self {
            entries,
            cursors: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matching a target: `"all"`, or one `providerId::modelId`
    /// sub-pool.
    pub fn sub_pool(&self, target: &str) -> Vec<&ModelPoolEntry> {
        if target == TARGET_ALL {
            return self.entries.iter().collect();
        }
        match target.split_once("::") {
            Some((provider_id, model_id)) => self
                .entries
                .iter()
                .filter(|e| e.provider_id == provider_id && e.model == model_id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of entries matching a target.
    pub fn sub_pool_len(&self, target: &str) -> usize {
        self.sub_pool(target).len()
    }

    /// Pick the next entry for a target and advance that target's cursor.
    ///
    /// Each target owns an independent cursor, so rotation stays fair across
    /// keys and models even when many calls interleave different targets.
    pub fn next_entry(&mut self, target: &str) -> Result<ModelPoolEntry, PoolError> {
        let indices: Vec<usize> = if target == TARGET_ALL {
            (0..self.entries.len()).collect()
        } else {
            match target.split_once("::") {
                Some((provider_id, model_id)) => self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.provider_id == provider_id && e.model == model_id)
                    .map(|(i, _)| i)
                    .collect(),
                None => Vec::new(),
            }
        };

        if indices.is_empty() {
            return Err(PoolError::EmptyTarget(target.to_string()));
        }

        let cursor = self.cursors.entry(target.to_string()).or_insert(0);
        let entry = self.entries[indices[*cursor % indices.len()]].clone();
        *cursor = (*cursor + 1) % indices.len();

        tracing::debug!(target = %target, entry = %entry.label(), "rotated to pool entry");
        Ok(entry)
    }
}
