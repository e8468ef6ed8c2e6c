//! Configuration surface for the catalog and plugin subsystems.
//!
//! Mirrors the rest of the gateway's config sections: `serde`-derived
//! structs with `#[serde(default)]` on every field and a `Default` impl
//! carrying the literal defaults, so a caller can load a `[catalog]` /
//! `[plugins]` table from a larger `toml` document (or omit it entirely).

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_pricing_url() -> String {
    "https://models.dev/api.json".to_string()
}

fn default_sync_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_fetch_timeout_secs() -> u64 {
    45
}

fn default_force_reload_timeout_secs() -> u64 {
    45
}

fn default_loader_download_timeout_secs() -> u64 {
    120
}

/// Configuration for a [`crate::catalog::ModelCatalog`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CatalogConfig {
    /// HTTP(S) endpoint serving the pricing JSON document.
    pub pricing_url: String,
    /// Minimum time between successful syncs.
    pub pricing_sync_interval_secs: u64,
    /// Timeout applied to the pricing download request.
    pub fetch_timeout_secs: u64,
    /// Timeout applied to `ForceReloadPricing`.
    pub force_reload_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            pricing_url: default_pricing_url(),
            pricing_sync_interval_secs: default_sync_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            force_reload_timeout_secs: default_force_reload_timeout_secs(),
        }
    }
}

impl CatalogConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.pricing_sync_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn force_reload_timeout(&self) -> Duration {
        Duration::from_secs(self.force_reload_timeout_secs)
    }
}

/// Configuration for [`crate::loader::PluginLoader`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PluginLoaderConfig {
    /// Timeout applied when the plugin artifact is fetched over HTTP(S).
    pub download_timeout_secs: u64,
}

impl Default for PluginLoaderConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: default_loader_download_timeout_secs(),
        }
    }
}

impl PluginLoaderConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_defaults_match_spec() {
        let cfg = CatalogConfig::default();
        assert_eq!(cfg.pricing_sync_interval_secs, 24 * 60 * 60);
        assert_eq!(cfg.fetch_timeout_secs, 45);
    }

    #[test]
    fn loader_defaults_match_spec() {
        let cfg = PluginLoaderConfig::default();
        assert_eq!(cfg.download_timeout_secs, 120);
    }

    #[test]
    fn catalog_config_roundtrips_through_toml() {
        let toml_str = r#"
            pricing_url = "https://example.test/pricing.json"
            pricing_sync_interval_secs = 3600
        "#;
        let cfg: CatalogConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.pricing_url, "https://example.test/pricing.json");
        assert_eq!(cfg.pricing_sync_interval_secs, 3600);
        // fetch_timeout_secs was omitted — falls back to Default.
        assert_eq!(cfg.fetch_timeout_secs, 45);
    }
}
