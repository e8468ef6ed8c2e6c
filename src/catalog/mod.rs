//! Thread-safe model catalog: pricing lookup, cost calculation, the
//! override engine, and the background sync worker that keeps pricing
//! data current.
//!
//! Three locks guard disjoint state, matching the concurrency contract:
//! `state` (pricing rows, model pool, base-model index) is read far more
//! than written and is never held across I/O; `overrides` is independent
//! and never held across a `state` read; `sync_config` is released before
//! the actual sync runs.
//!
//! A catalog's background sync worker borrows `Arc<ModelCatalog>`, so
//! construction returns an `Arc` rather than a bare value.

mod cost;
mod overrides;
mod sync;
mod types;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub use cost::{apply_cache_debug_overlay, calculate_cost, CacheDebugStatus};
pub use overrides::{compile_overrides, select_override, MatchType, OverrideRule};
pub use sync::{
    run_sync_tick, should_sync_pricing, DistributedLock, DistributedLockManager,
    HttpPricingFetcher, InMemoryPricingStore, LocalLockManager, PricingFetcher, PricingStore,
    StoredPricingEntry, SyncGate, LAST_SYNC_CONFIG_KEY, PRICING_SYNC_LOCK_NAME,
};
pub use types::{
    base_model_name, normalize_provider, Mode, ModelPool, PricingKey, PricingRow, Tier,
    UsageRecord,
};

use crate::catalog::overrides::CompiledOverride;
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};

struct CatalogState {
    pricing_data: HashMap<PricingKey, PricingRow>,
    model_pool: ModelPool,
    base_model_index: HashMap<String, String>,
}

impl CatalogState {
    fn empty() -> Self {
        Self {
            pricing_data: HashMap::new(),
            model_pool: HashMap::new(),
            base_model_index: HashMap::new(),
        }
    }

    fn insert_row(&mut self, entry: &StoredPricingEntry) {
        let provider = normalize_provider(&entry.provider);
        self.model_pool
            .entry(provider.clone())
            .or_default()
            .insert(entry.model.clone());
        self.base_model_index
            .insert(entry.model.clone(), base_model_name(&entry.model));
        self.pricing_data.insert(
            PricingKey {
                model: entry.model.clone(),
                provider,
                mode: entry.mode,
            },
            entry.row.clone(),
        );
    }

    fn rebuild_from(entries: &[StoredPricingEntry]) -> Self {
        let mut state = Self::empty();
        for entry in entries {
            state.insert_row(entry);
        }
        state
    }
}

struct SyncConfigState {
    pricing_url: String,
    pricing_sync_interval_secs: u64,
    fetch_timeout_secs: u64,
    force_reload_timeout_secs: u64,
}

impl From<&CatalogConfig> for SyncConfigState {
    fn from(cfg: &CatalogConfig) -> Self {
        Self {
            pricing_url: cfg.pricing_url.clone(),
            pricing_sync_interval_secs: cfg.pricing_sync_interval_secs,
            fetch_timeout_secs: cfg.fetch_timeout_secs,
            force_reload_timeout_secs: cfg.force_reload_timeout_secs,
        }
    }
}

impl SyncConfigState {
    fn as_catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            pricing_url: self.pricing_url.clone(),
            pricing_sync_interval_secs: self.pricing_sync_interval_secs,
            fetch_timeout_secs: self.fetch_timeout_secs,
            force_reload_timeout_secs: self.force_reload_timeout_secs,
        }
    }
}

struct SyncHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// The thread-safe model catalog and cost engine.
pub struct ModelCatalog {
    state: RwLock<CatalogState>,
    overrides: RwLock<HashMap<String, Vec<CompiledOverride>>>,
    sync_config: RwLock<SyncConfigState>,
    store: Option<Arc<dyn PricingStore>>,
    lock_manager: Option<Arc<dyn DistributedLockManager>>,
    fetcher: Arc<dyn PricingFetcher>,
    gate: Option<SyncGate>,
    sync_task: AsyncMutex<Option<SyncHandle>>,
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ModelCatalog")
            .field("pricing_rows", &state.pricing_data.len())
            .field("providers", &state.model_pool.len())
            .field("overrides_for", &self.overrides.read().len())
            .finish()
    }
}

impl ModelCatalog {
    /// Creates a catalog, performing the initial load (from the store if
    /// one is configured and non-empty, otherwise directly from the
    /// pricing URL) and starting the background sync worker.
    pub async fn new(
        config: CatalogConfig,
        store: Option<Arc<dyn PricingStore>>,
        lock_manager: Option<Arc<dyn DistributedLockManager>>,
        fetcher: Arc<dyn PricingFetcher>,
        gate: Option<SyncGate>,
    ) -> CatalogResult<Arc<Self>> {
        let initial = Self::initial_load(&config, store.as_deref(), fetcher.as_ref()).await?;

        let catalog = Arc::new(Self {
            state: RwLock::new(CatalogState::rebuild_from(&initial)),
            overrides: RwLock::new(HashMap::new()),
            sync_config: RwLock::new(SyncConfigState::from(&config)),
            store,
            lock_manager,
            fetcher,
            gate,
            sync_task: AsyncMutex::new(None),
        });

        Arc::clone(&catalog).start_sync_worker().await;
        Ok(catalog)
    }

    async fn initial_load(
        config: &CatalogConfig,
        store: Option<&dyn PricingStore>,
        fetcher: &dyn PricingFetcher,
    ) -> CatalogResult<Vec<StoredPricingEntry>> {
        if let Some(store) = store {
            let existing = store.get_model_prices().await?;
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let doc = fetcher.fetch(&config.pricing_url, config.fetch_timeout()).await?;
        let entries = sync::parse_pricing_document(&doc)?;
        if let Some(store) = store {
            store
                .upsert_model_prices_transactional(entries.clone())
                .await?;
        }
        Ok(entries)
    }

    /// Spawns the hourly-ticked sync loop. A no-op when the catalog was
    /// built without a pricing store, since there is nothing to refresh
    /// against.
    async fn start_sync_worker(self: Arc<Self>) {
        if self.store.is_none() {
            return;
        }

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let catalog = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        catalog.run_one_tick(&worker_cancel).await;
                    }
                }
            }
        });

        *self.sync_task.lock().await = Some(SyncHandle { cancel, task });
    }

    async fn run_one_tick(&self, cancel: &CancellationToken) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let config = self.sync_config.read().as_catalog_config();

        let tick_result = run_sync_tick(
            store.as_ref(),
            self.lock_manager.as_deref(),
            self.fetcher.as_ref(),
            &config,
            self.gate.as_ref(),
            cancel,
        )
        .await;

        match tick_result {
            Ok(Some(entries)) => {
                *self.state.write() = CatalogState::rebuild_from(&entries);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "pricing sync tick failed, will retry next tick");
            }
        }
    }

    /// Returns the first matching row scanning modes in the fixed order,
    /// with override patching applied. `mode_hint` selects a specific
    /// mode instead of scanning when provided.
    pub fn get_pricing_for_model(
        &self,
        model: &str,
        provider: &str,
        mode_hint: Option<Mode>,
    ) -> Option<PricingRow> {
        let normalized_provider = normalize_provider(provider);

        if let Some(mode) = mode_hint {
            return self
                .lookup_with_fallback(model, &normalized_provider, mode)
                .map(|row| self.apply_overrides(&normalized_provider, model, mode, row));
        }

        for &mode in Mode::SCAN_ORDER.iter() {
            if let Some(row) = self.lookup_with_fallback(model, &normalized_provider, mode) {
                return Some(self.apply_overrides(&normalized_provider, model, mode, row));
            }
        }
        None
    }

    fn direct_hit(&self, model: &str, provider: &str, mode: Mode) -> Option<PricingRow> {
        let state = self.state.read();
        state
            .pricing_data
            .get(&PricingKey {
                model: model.to_string(),
                provider: provider.to_string(),
                mode,
            })
            .cloned()
    }

    /// Implements steps 2-7 of the pricing lookup fallback algorithm; mode
    /// normalization (step 1) is the caller's job via `mode_hint`/scan
    /// order.
    fn lookup_with_fallback(&self, model: &str, provider: &str, mode: Mode) -> Option<PricingRow> {
        if let Some(row) = self.direct_hit(model, provider, mode) {
            return Some(row);
        }

        if provider == "gemini" {
            if let Some(row) = self.direct_hit(model, "vertex", mode) {
                return Some(row);
            }
            if mode.is_responses_family() {
                if let Some(row) = self.direct_hit(model, "vertex", Mode::Chat) {
                    return Some(row);
                }
            }
        }

        if provider == "vertex" {
            if let Some((_, suffix)) = model.split_once('/') {
                if let Some(row) = self.direct_hit(suffix, provider, mode) {
                    return Some(row);
                }
                if mode.is_responses_family() {
                    if let Some(row) = self.direct_hit(suffix, provider, Mode::Chat) {
                        return Some(row);
                    }
                }
            }
        }

        if provider == "bedrock" && model.contains("claude") && !model.starts_with("anthropic.") {
            let prefixed = format!("anthropic.{model}");
            if let Some(row) = self.direct_hit(&prefixed, provider, mode) {
                return Some(row);
            }
            if mode.is_responses_family() {
                if let Some(row) = self.direct_hit(&prefixed, provider, Mode::Chat) {
                    return Some(row);
                }
            }
        }

        if mode.is_responses_family() {
            if let Some(row) = self.direct_hit(model, provider, Mode::Chat) {
                return Some(row);
            }
        }

        None
    }

    /// Computes the cost of one usage record for `(model, provider, mode)`.
    ///
    /// Performs the pricing lookup itself (step 2 of the cost-calculation
    /// algorithm): a direct/fallback hit via [`Self::get_pricing_for_model`],
    /// retried under `usage.deployment_id` on a miss, `0.0` on a full miss.
    /// Dispatches the resolved row through [`cost::calculate_cost`] keyed
    /// on `mode`, then applies `cache_status` as the step-4 overlay. Pass
    /// `CacheDebugStatus::Disabled` when no cache layer is in play.
    pub fn calculate_cost(
        &self,
        model: &str,
        provider: &str,
        mode: Mode,
        usage: &UsageRecord,
        cache_status: &CacheDebugStatus,
    ) -> f64 {
        let row = self
            .get_pricing_for_model(model, provider, Some(mode))
            .or_else(|| {
                usage.deployment_id.as_deref().and_then(|deployment_id| {
                    self.get_pricing_for_model(deployment_id, provider, Some(mode))
                })
            });

        let Some(row) = row else {
            return 0.0;
        };

        let base = calculate_cost(&row, mode, usage);
        apply_cache_debug_overlay(base, cache_status)
    }

    fn apply_overrides(&self, provider: &str, model: &str, mode: Mode, row: PricingRow) -> PricingRow {
        let overrides = self.overrides.read();
        match overrides
            .get(provider)
            .and_then(|rules| select_override(rules, model, mode))
        {
            Some(chosen) => overrides::apply_override(&row, &chosen.patch),
            None => row,
        }
    }

    /// Returns a defensive copy of the model names known for `provider`.
    pub fn get_models_for_provider(&self, provider: &str) -> Vec<String> {
        let normalized = normalize_provider(provider);
        self.state
            .read()
            .model_pool
            .get(&normalized)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolves the canonical base model name recorded for `model` (e.g.
    /// `claude-3-5-sonnet-20241022` -> `claude-3-5-sonnet`), used for
    /// model-equivalence queries.
    pub fn resolve_base_model_name(&self, model: &str) -> Option<String> {
        self.state.read().base_model_index.get(model).cloned()
    }

    /// Returns the providers under which `model` is known, including the
    /// `openrouter`/`vertex`/`groq`/`bedrock` augmentation rules.
    pub fn get_providers_for_model(&self, model: &str) -> Vec<String> {
        let state = self.state.read();
        let mut found = HashSet::new();

        for (provider, models) in &state.model_pool {
            if models.contains(model) {
                found.insert(provider.clone());
            }
        }

        let prefixed_openrouter = format!("openrouter/{model}");
        if state
            .model_pool
            .get("openrouter")
            .is_some_and(|set| set.contains(&prefixed_openrouter) || set.contains(model))
        {
            found.insert("openrouter".to_string());
        }

        let prefixed_vertex = format!("vertex/{model}");
        if state
            .model_pool
            .get("vertex")
            .is_some_and(|set| set.contains(&prefixed_vertex) || set.contains(model))
        {
            found.insert("vertex".to_string());
        }

        if model.contains("gpt-") {
            let openai_equivalent = format!("openai/{model}");
            if state
                .model_pool
                .get("groq")
                .is_some_and(|set| set.contains(&openai_equivalent))
            {
                found.insert("groq".to_string());
            }
        }

        if model.contains("claude")
            && state
                .model_pool
                .get("bedrock")
                .is_some_and(|set| set.iter().any(|m| m.contains(model)))
        {
            found.insert("bedrock".to_string());
        }

        found.into_iter().collect()
    }

    /// Parses `provider/model` entries, normalizes the provider, and
    /// inserts each uniquely into the pool.
    pub fn add_model_data_to_pool(&self, entries: &[String]) {
        let mut state = self.state.write();
        for entry in entries {
            let Some((provider, model)) = entry.split_once('/') else {
                continue;
            };
            let provider = normalize_provider(provider);
            state.model_pool.entry(provider).or_default().insert(model.to_string());
        }
    }

    /// Drops `provider` from the pool without touching pricing rows.
    pub fn delete_model_data_for_provider(&self, provider: &str) {
        let normalized = normalize_provider(provider);
        self.state.write().model_pool.remove(&normalized);
    }

    /// Applies known provider-specific aliasing; currently only the
    /// `groq` + `gpt-oss-120b` alias.
    pub fn refine_model_for_provider(&self, provider: &str, model: &str) -> String {
        if normalize_provider(provider) == "groq" && model == "gpt-oss-120b" {
            return "openai/gpt-oss-120b".to_string();
        }
        model.to_string()
    }

    /// Compiles and installs override rules for `provider`, replacing any
    /// previously installed set.
    pub fn set_provider_pricing_overrides(
        &self,
        provider: &str,
        rules: &[OverrideRule],
    ) -> CatalogResult<()> {
        let compiled = compile_overrides(rules)?;
        let normalized = normalize_provider(provider);
        self.overrides.write().insert(normalized, compiled);
        Ok(())
    }

    /// Removes all override rules for `provider`; subsequent lookups
    /// return the un-patched base row.
    pub fn delete_provider_pricing_overrides(&self, provider: &str) {
        let normalized = normalize_provider(provider);
        self.overrides.write().remove(&normalized);
    }

    /// Atomically updates the URL/interval and restarts the sync worker,
    /// triggering an immediate sync.
    pub async fn reload_pricing(self: &Arc<Self>, config: CatalogConfig) -> CatalogResult<()> {
        *self.sync_config.write() = SyncConfigState::from(&config);

        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
        Arc::clone(self).start_sync_worker().await;
        self.force_reload_pricing().await
    }

    /// Resets the ticker and performs one sync under a bounded timeout.
    pub async fn force_reload_pricing(&self) -> CatalogResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let config = self.sync_config.read().as_catalog_config();
        let cancel = CancellationToken::new();

        let tick = run_sync_tick(
            store.as_ref(),
            self.lock_manager.as_deref(),
            self.fetcher.as_ref(),
            &config,
            self.gate.as_ref(),
            &cancel,
        );

        let result = tokio::time::timeout(config.force_reload_timeout(), tick)
            .await
            .map_err(|_| CatalogError::Cancelled)??;

        if let Some(entries) = result {
            *self.state.write() = CatalogState::rebuild_from(&entries);
        }
        Ok(())
    }

    /// Idempotent shutdown: cancels the sync worker and waits for it.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(input: f64, output: f64) -> PricingRow {
        PricingRow {
            input_cost_per_token: Some(input),
            output_cost_per_token: Some(output),
            ..Default::default()
        }
    }

    async fn seeded_catalog(entries: Vec<StoredPricingEntry>) -> Arc<ModelCatalog> {
        let store = Arc::new(InMemoryPricingStore::new());
        for e in &entries {
            store.seed(&e.model, &e.provider, e.mode, e.row.clone());
        }
        ModelCatalog::new(
            CatalogConfig::default(),
            Some(store),
            None,
            Arc::new(sync::tests_support::EmptyFetcher),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn sc2_responses_falls_back_to_chat() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            mode: Mode::Chat,
            row: row(0.000005, 0.000015),
        }])
        .await;

        let found = catalog
            .get_pricing_for_model("gpt-4o", "openai", Some(Mode::Responses))
            .expect("responses should fall back to chat");
        assert_eq!(found.input_cost_per_token, Some(0.000005));
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn invariant_1_provider_is_normalized_on_hit() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "claude-3-5-sonnet".to_string(),
            provider: "aws-bedrock-runtime".to_string(),
            mode: Mode::Chat,
            row: row(1.0, 2.0),
        }])
        .await;

        assert!(catalog
            .get_pricing_for_model("claude-3-5-sonnet", "bedrock", Some(Mode::Chat))
            .is_some());
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn invariant_3_override_removal_restores_base_row() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            mode: Mode::Chat,
            row: row(1.0, 2.0),
        }])
        .await;

        catalog
            .set_provider_pricing_overrides(
                "openai",
                &[OverrideRule {
                    match_type: MatchType::Exact,
                    pattern: "gpt-4o".to_string(),
                    mode_filter: None,
                    patch: row(20.0, 2.0),
                }],
            )
            .unwrap();
        let patched = catalog
            .get_pricing_for_model("gpt-4o", "openai", Some(Mode::Chat))
            .unwrap();
        assert_eq!(patched.input_cost_per_token, Some(20.0));

        catalog.delete_provider_pricing_overrides("openai");
        let restored = catalog
            .get_pricing_for_model("gpt-4o", "openai", Some(Mode::Chat))
            .unwrap();
        assert_eq!(restored.input_cost_per_token, Some(1.0));
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn bedrock_anthropic_prefix_fallback() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "anthropic.claude-3-sonnet".to_string(),
            provider: "bedrock".to_string(),
            mode: Mode::Chat,
            row: row(1.0, 2.0),
        }])
        .await;

        assert!(catalog
            .get_pricing_for_model("claude-3-sonnet", "bedrock", Some(Mode::Chat))
            .is_some());
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn refine_model_applies_groq_alias() {
        let catalog = seeded_catalog(vec![]).await;
        assert_eq!(
            catalog.refine_model_for_provider("groq", "gpt-oss-120b"),
            "openai/gpt-oss-120b"
        );
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn models_for_provider_is_a_defensive_copy() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            mode: Mode::Chat,
            row: row(1.0, 2.0),
        }])
        .await;

        let mut first = catalog.get_models_for_provider("openai");
        first.push("not-real".to_string());
        let second = catalog.get_models_for_provider("openai");
        assert_eq!(second, vec!["gpt-4o".to_string()]);
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn calculate_cost_falls_back_to_deployment_id_on_a_miss() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "my-gpt4-deployment".to_string(),
            provider: "azure".to_string(),
            mode: Mode::Chat,
            row: row(0.000005, 0.000015),
        }])
        .await;

        let usage = UsageRecord {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
            deployment_id: Some("my-gpt4-deployment".to_string()),
            ..Default::default()
        };
        let cost = catalog.calculate_cost(
            "gpt-4o",
            "azure",
            Mode::Chat,
            &usage,
            &CacheDebugStatus::Disabled,
        );
        assert!((cost - 0.0125).abs() < 1e-12);
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn calculate_cost_returns_zero_on_a_full_miss() {
        let catalog = seeded_catalog(vec![]).await;
        let usage = UsageRecord::default();
        let cost = catalog.calculate_cost(
            "unknown-model",
            "openai",
            Mode::Chat,
            &usage,
            &CacheDebugStatus::Disabled,
        );
        assert_eq!(cost, 0.0);
        catalog.cleanup().await;
    }

    #[tokio::test]
    async fn calculate_cost_applies_the_cache_debug_overlay() {
        let catalog = seeded_catalog(vec![StoredPricingEntry {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            mode: Mode::Chat,
            row: row(1.0, 1.0),
        }])
        .await;

        let usage = UsageRecord {
            prompt_tokens: 100,
            ..Default::default()
        };
        let cost = catalog.calculate_cost(
            "gpt-4o",
            "openai",
            Mode::Chat,
            &usage,
            &CacheDebugStatus::DirectHit,
        );
        assert_eq!(cost, 0.0);
        catalog.cleanup().await;
    }
}
