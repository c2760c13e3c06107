// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.

use serde::{Deserialize, Serialize};

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Model identifier (e.g. "gpt-4o", "deepseek-chat")
    pub id: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// USD per million input tokens
    #[serde(default)]
    pub input_per_mtok: f64,
    /// USD per million output tokens
    #[serde(default)]
    pub output_per_mtok: f64,
    /// USD per million cache-read tokens
    #[serde(default)]
    pub cache_read_per_mtok: f64,
    /// USD per million cache-creation tokens
    #[serde(default)]
    pub cache_write_per_mtok: f64,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Strip any provider/vendor prefix from a model id: the catalog stores bare
/// ids, while gateways report `provider/vendor/model`.
pub fn normalize_model_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Look up a model by id, tolerating provider-prefixed forms.
pub fn lookup(model_id: &str) -> Option<ModelCatalogEntry> {
    let bare = normalize_model_id(model_id);
    static_catalog().into_iter().find(|e| e.id == bare)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalog_parses_and_is_nonempty() {
        let entries = static_catalog();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e.context_window > 0));
    }

    #[test]
    fn lookup_by_bare_id() {
        let e = lookup("gpt-4o").unwrap();
        assert_eq!(e.id, "gpt-4o");
        assert_eq!(e.context_window, 128_000);
    }

    #[test]
    fn lookup_strips_provider_prefix() {
        let e = lookup("openrouter/deepseek/deepseek-chat").unwrap();
        assert_eq!(e.id, "deepseek-chat");
    }

    #[test]
    fn lookup_unknown_is_none() {
        assert!(lookup("no-such-model").is_none());
    }

    #[test]
    fn normalize_passes_bare_ids_through() {
        assert_eq!(normalize_model_id("gpt-4o"), "gpt-4o");
        assert_eq!(normalize_model_id("a/b/c"), "c");
    }
}
