// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-model pricing registry and the session cost tracker.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

use tracing::debug;

use crate::{
    catalog::{normalize_model_id, static_catalog},
    types::Usage,
};

/// USD prices per million tokens for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl ModelPricing {
    /// Cost of one turn's usage under this pricing.
    pub fn cost_usd(&self, usage: &Usage) -> f64 {
        // Cache reads are billed at the cache-read rate instead of the input
        // rate; the provider reports them inside input_tokens.
        let fresh_input = usage.input_tokens.saturating_sub(usage.cache_read_tokens);
        fresh_input as f64 / 1e6 * self.input_per_mtok
            + usage.cache_read_tokens as f64 / 1e6 * self.cache_read_per_mtok
            + usage.cache_creation_tokens as f64 / 1e6 * self.cache_write_per_mtok
            + usage.output_tokens as f64 / 1e6 * self.output_per_mtok
    }
}

/// Process-wide pricing registry, seeded from the static catalog.
/// Read-mostly: lookups take the read lock, registration the write lock.
fn registry() -> &'static RwLock<HashMap<String, ModelPricing>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ModelPricing>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        for entry in static_catalog() {
            map.insert(
                entry.id.clone(),
                ModelPricing {
                    input_per_mtok: entry.input_per_mtok,
                    output_per_mtok: entry.output_per_mtok,
                    cache_read_per_mtok: entry.cache_read_per_mtok,
                    cache_write_per_mtok: entry.cache_write_per_mtok,
                },
            );
        }
        RwLock::new(map)
    })
}

/// Register (or override) pricing for a model id.
pub fn register_pricing(model_id: &str, pricing: ModelPricing) {
    registry()
        .write()
        .expect("pricing registry poisoned")
        .insert(normalize_model_id(model_id).to_string(), pricing);
}

/// Look up pricing, tolerating provider-prefixed ids.
pub fn lookup_pricing(model_id: &str) -> Option<ModelPricing> {
    registry()
        .read()
        .expect("pricing registry poisoned")
        .get(normalize_model_id(model_id))
        .copied()
}

#[derive(Debug, Clone, Default)]
struct ModelCost {
    usage: Usage,
    cost_usd: f64,
}

/// Accumulates usage and cost per model across a session.
///
/// One tracker typically belongs to one loop, but adds are mutex-guarded so
/// any instance is safe for concurrent use from multiple tasks.
#[derive(Default)]
pub struct CostTracker {
    per_model: Mutex<HashMap<String, ModelCost>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one turn's usage for `model_id` and return the cost delta in
    /// USD.  Unknown models cost zero.
    pub fn add_usage(&self, model_id: &str, usage: &Usage) -> f64 {
        let bare = normalize_model_id(model_id).to_string();
        let delta = match lookup_pricing(&bare) {
            Some(p) => p.cost_usd(usage),
            None => {
                debug!(model = %bare, "no pricing for model; counting cost as 0");
                0.0
            }
        };
        let mut map = self.per_model.lock().expect("cost tracker poisoned");
        let entry = map.entry(bare).or_default();
        entry.usage.add(usage);
        entry.cost_usd += delta;
        delta
    }

    /// Cumulative cost across all models.
    pub fn total_usd(&self) -> f64 {
        self.per_model
            .lock()
            .expect("cost tracker poisoned")
            .values()
            .map(|c| c.cost_usd)
            .sum()
    }

    /// Cumulative usage across all models.
    pub fn total_usage(&self) -> Usage {
        let map = self.per_model.lock().expect("cost tracker poisoned");
        let mut total = Usage::default();
        for c in map.values() {
            total.add(&c.usage);
        }
        total
    }

    /// Per-model cost breakdown in USD.
    pub fn breakdown(&self) -> HashMap<String, f64> {
        self.per_model
            .lock()
            .expect("cost tracker poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.cost_usd))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
