// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adapter selection by probed cluster version.

use super::http::HttpStore;
use super::{ApiVersion, StoreAdapter};
use crate::config::ClusterConfig;
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

/// Probe `config.url` and return an adapter speaking its dialect.
///
/// `7.*` selects V7, `6.*` V6, `5.*` V5, anything else V0.
pub async fn resolve_adapter(config: &ClusterConfig, name: &str) -> Result<Arc<dyn StoreAdapter>> {
    let probe = HttpStore::new(name, config)?;
    let version = probe.cluster_version().await?;
    let api_version = version.api_version();

    info!(
        store = %name,
        url = %config.url,
        cluster = %version.cluster_name,
        version = %version.version.number,
        api = %api_version,
        "Resolved store adapter"
    );

    Ok(Arc::new(probe.with_version(api_version)))
}

/// Build an adapter for a known dialect without probing.
pub fn adapter_for_version(config: &ClusterConfig, name: &str, version: ApiVersion) -> Result<Arc<dyn StoreAdapter>> {
    Ok(Arc::new(HttpStore::new(name, config)?.with_version(version)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for_version() {
        let config = ClusterConfig::for_testing("http://localhost:9200", "idx");
        let adapter = adapter_for_version(&config, "target", ApiVersion::V5).unwrap();
        assert_eq!(adapter.api_version(), ApiVersion::V5);
        assert_eq!(adapter.name(), "target");
    }

    #[tokio::test]
    async fn test_resolve_unreachable_is_transport_error() {
        let mut config = ClusterConfig::for_testing("http://127.0.0.1:1", "idx");
        config.request_timeout = "2s".into();
        let err = resolve_adapter(&config, "source").await.err().unwrap();
        assert!(err.is_retryable());
    }
}
