// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target index settings around a run.
//!
//! Refreshing during a bulk load is wasted work, so the target's
//! `refresh_interval` is switched off before writing and put back after.
//! The recorded value may be absent (the index uses the cluster default);
//! restoring writes `null`, which resets the setting.

use crate::error::Result;
use crate::store::StoreAdapter;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refresh intervals recorded before a run.
pub struct SettingsGuard {
    target: Arc<dyn StoreAdapter>,
    saved: Vec<(String, Value)>,
}

impl SettingsGuard {
    /// Record each matching index's refresh interval and disable refresh.
    ///
    /// An index whose settings cannot be read (usually one that does not
    /// exist yet) is left alone.
    pub async fn relax(target: Arc<dyn StoreAdapter>, indices: &str) -> Self {
        let mut saved = Vec::new();
        match target.index_settings(indices).await {
            Ok(body) => saved = refresh_intervals(&body),
            Err(e) => {
                warn!(indices, error = %e, "Cannot read target settings; refresh interval left unchanged");
            }
        }

        let mut relaxed = Vec::with_capacity(saved.len());
        for (index, previous) in saved {
            match target
                .update_index_settings(&index, json!({ "index": { "refresh_interval": "-1" } }))
                .await
            {
                Ok(()) => {
                    debug!(index = %index, previous = %previous, "Refresh disabled");
                    relaxed.push((index, previous));
                }
                Err(e) => warn!(index = %index, error = %e, "Failed to disable refresh"),
            }
        }

        Self { target, saved: relaxed }
    }

    /// Indices whose settings were changed.
    pub fn indices(&self) -> impl Iterator<Item = &str> {
        self.saved.iter().map(|(index, _)| index.as_str())
    }

    /// Put the recorded intervals back and optionally refresh.
    ///
    /// Every index is attempted; the first failure is returned.
    pub async fn restore(self, refresh: bool) -> Result<()> {
        let mut first_error = None;
        for (index, previous) in &self.saved {
            let result = self
                .target
                .update_index_settings(index, json!({ "index": { "refresh_interval": previous } }))
                .await;
            if let Err(e) = result {
                warn!(index = %index, error = %e, "Failed to restore refresh interval");
                first_error.get_or_insert(e);
                continue;
            }
            if refresh {
                if let Err(e) = self.target.refresh_index(index).await {
                    warn!(index = %index, error = %e, "Failed to refresh index");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !self.saved.is_empty() {
            info!(indices = self.saved.len(), refresh, "Target settings restored");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pull `refresh_interval` per index out of a settings response.
fn refresh_intervals(body: &Value) -> Vec<(String, Value)> {
    let Some(indices) = body.as_object() else {
        return Vec::new();
    };
    indices
        .iter()
        .map(|(index, entry)| {
            let interval = entry
                .pointer("/settings/index/refresh_interval")
                .cloned()
                .unwrap_or(Value::Null);
            (index.clone(), interval)
        })
        .collect()
}
