//! Pricing store / distributed lock contracts and the background sync
//! worker that refreshes a [`crate::catalog::ModelCatalog`] from them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::types::{Mode, PricingRow};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};

/// Well-known distributed-lock name used for every catalog's pricing sync.
pub const PRICING_SYNC_LOCK_NAME: &str = "model_catalog_pricing_sync";
/// Well-known config-bag key the last successful sync timestamp is stored
/// under, as an RFC3339 string.
pub const LAST_SYNC_CONFIG_KEY: &str = "model_catalog_last_pricing_sync";

/// One row as persisted by the pricing store, carrying its key alongside
/// the dollars-per-unit fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPricingEntry {
    pub model: String,
    pub provider: String,
    pub mode: Mode,
    pub row: PricingRow,
}

/// A `{ key, value }` pair in the store's key/value config bag.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// External persistence for pricing rows and sync bookkeeping. The core
/// never assumes a particular backend — callers supply an implementation
/// (Postgres, SQLite, a remote API, or the in-memory one below for tests).
#[async_trait]
pub trait PricingStore: Send + Sync {
    async fn get_model_prices(&self) -> CatalogResult<Vec<StoredPricingEntry>>;

    /// Deduplicates by `(model, provider, mode)` and upserts every row in
    /// a single transaction. A failure here must not be followed by an
    /// in-memory rebuild.
    async fn upsert_model_prices_transactional(
        &self,
        rows: Vec<StoredPricingEntry>,
    ) -> CatalogResult<()>;

    async fn get_config(&self, key: &str) -> CatalogResult<Option<ConfigEntry>>;

    async fn update_config(&self, entry: ConfigEntry) -> CatalogResult<()>;
}

/// Named mutual exclusion across processes. `lock`/`unlock` each take a
/// cancellation token standing in for the Go contract's `ctx`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn lock(&self, cancel: &CancellationToken) -> CatalogResult<()>;
    async fn unlock(&self, cancel: &CancellationToken) -> CatalogResult<()>;
}

/// Produces named locks. Implementations must be fair enough that a
/// failed acquisition returns promptly rather than blocking the tick.
#[async_trait]
pub trait DistributedLockManager: Send + Sync {
    async fn new_lock(&self, name: &str) -> Arc<dyn DistributedLock>;
}

/// Downloads the pricing JSON document from a configurable URL.
#[async_trait]
pub trait PricingFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> CatalogResult<serde_json::Value>;
}

/// `reqwest`-backed fetcher — the default used outside of tests.
pub struct HttpPricingFetcher {
    client: reqwest::Client,
}

impl HttpPricingFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPricingFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PricingFetcher for HttpPricingFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> CatalogResult<serde_json::Value> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CatalogError::TransientUpstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::TransientUpstream(format!(
                "pricing endpoint returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::TransientUpstream(e.to_string()))
    }
}

/// In-memory [`PricingStore`] for tests and for callers that don't wire a
/// real backend. Mirrors the shape of a real repository without any I/O.
#[derive(Default)]
pub struct InMemoryPricingStore {
    rows: AsyncMutex<HashMap<(String, String, Mode), PricingRow>>,
    config: AsyncMutex<HashMap<String, String>>,
}

impl InMemoryPricingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, model: &str, provider: &str, mode: Mode, row: PricingRow) {
        self.rows
            .try_lock()
            .expect("seed called concurrently with sync")
            .insert((model.to_string(), provider.to_string(), mode), row);
    }
}

#[async_trait]
impl PricingStore for InMemoryPricingStore {
    async fn get_model_prices(&self) -> CatalogResult<Vec<StoredPricingEntry>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .map(|((model, provider, mode), row)| StoredPricingEntry {
                model: model.clone(),
                provider: provider.clone(),
                mode: *mode,
                row: row.clone(),
            })
            .collect())
    }

    async fn upsert_model_prices_transactional(
        &self,
        entries: Vec<StoredPricingEntry>,
    ) -> CatalogResult<()> {
        let mut dedup: HashMap<(String, String, Mode), PricingRow> = HashMap::new();
        for entry in entries {
            dedup.insert((entry.model, entry.provider, entry.mode), entry.row);
        }
        let mut rows = self.rows.lock().await;
        for (key, row) in dedup {
            rows.insert(key, row);
        }
        Ok(())
    }

    async fn get_config(&self, key: &str) -> CatalogResult<Option<ConfigEntry>> {
        let config = self.config.lock().await;
        Ok(config.get(key).map(|v| ConfigEntry {
            key: key.to_string(),
            value: v.clone(),
        }))
    }

    async fn update_config(&self, entry: ConfigEntry) -> CatalogResult<()> {
        self.config.lock().await.insert(entry.key, entry.value);
        Ok(())
    }
}

/// In-process [`DistributedLockManager`] — a single-node fallback for
/// callers who don't run a real distributed lock service. Fair in the
/// sense `tokio::sync::Mutex` is fair (FIFO).
#[derive(Default)]
pub struct LocalLockManager {
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLockManager for LocalLockManager {
    async fn new_lock(&self, name: &str) -> Arc<dyn DistributedLock> {
        let mut locks = self.locks.lock().await;
        let mutex = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        Arc::new(LocalLock { mutex, guard: AsyncMutex::new(None) })
    }
}

struct LocalLock {
    mutex: Arc<AsyncMutex<()>>,
    guard: AsyncMutex<Option<tokio::sync::OwnedMutexGuard<()>>>,
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn lock(&self, cancel: &CancellationToken) -> CatalogResult<()> {
        tokio::select! {
            acquired = self.mutex.clone().lock_owned() => {
                *self.guard.lock().await = Some(acquired);
                Ok(())
            }
            _ = cancel.cancelled() => Err(CatalogError::Cancelled),
        }
    }

    async fn unlock(&self, _cancel: &CancellationToken) -> CatalogResult<()> {
        self.guard.lock().await.take();
        Ok(())
    }
}

/// Optional gate consulted before each tick; when it returns `false` the
/// tick is skipped even if the interval has elapsed.
pub type SyncGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Decides whether a sync should run: true if no last-sync record exists,
/// its timestamp is unparseable, or `now - last_sync >= interval`.
pub fn should_sync_pricing(
    last_sync: Option<&str>,
    now: chrono::DateTime<chrono::Utc>,
    interval: Duration,
) -> bool {
    let Some(raw) = last_sync else {
        return true;
    };
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) else {
        return true;
    };
    let elapsed = now.signed_duration_since(parsed.with_timezone(&chrono::Utc));
    elapsed >= chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX)
}

/// Parses the pricing JSON document (`model_key -> entry`) into rows keyed
/// by `(model, provider, mode)`, applying provider normalization and
/// discarding the model-key's own provider prefix in favor of the entry's
/// explicit `provider` field, per the external-interfaces contract.
pub fn parse_pricing_document(doc: &serde_json::Value) -> CatalogResult<Vec<StoredPricingEntry>> {
    let object = doc.as_object().ok_or_else(|| {
        CatalogError::TransientUpstream("pricing document is not a JSON object".to_string())
    })?;

    let mut entries = Vec::with_capacity(object.len());
    for (model_key, value) in object {
        let model = model_key.rsplit('/').next().unwrap_or(model_key).to_string();

        let provider_raw = value
            .get("provider")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let provider = crate::catalog::types::normalize_provider(provider_raw);

        let mode_raw = value.get("mode").and_then(|v| v.as_str()).unwrap_or("chat");
        let Some(mode) = Mode::parse(mode_raw) else {
            continue;
        };

        let row: PricingRow = serde_json::from_value(value.clone())
            .map_err(|e| CatalogError::TransientUpstream(e.to_string()))?;

        entries.push(StoredPricingEntry {
            model,
            provider,
            mode,
            row,
        });
    }
    Ok(entries)
}

/// One tick of the sync worker's procedure (spec §4.3), independent of the
/// `tokio::time` scheduling loop so it can be exercised directly in tests.
pub async fn run_sync_tick(
    store: &dyn PricingStore,
    lock_manager: Option<&dyn DistributedLockManager>,
    fetcher: &dyn PricingFetcher,
    config: &CatalogConfig,
    gate: Option<&SyncGate>,
    cancel: &CancellationToken,
) -> CatalogResult<Option<Vec<StoredPricingEntry>>> {
    let lock = match lock_manager {
        Some(manager) => {
            let lock = manager.new_lock(PRICING_SYNC_LOCK_NAME).await;
            if lock.lock(cancel).await.is_err() {
                tracing::debug!("skipping sync tick: failed to acquire distributed lock");
                return Ok(None);
            }
            Some(lock)
        }
        None => None,
    };

    let result = run_sync_tick_locked(store, fetcher, config, gate, cancel).await;

    if let Some(lock) = lock {
        let _ = lock.unlock(cancel).await;
    }

    result
}

async fn run_sync_tick_locked(
    store: &dyn PricingStore,
    fetcher: &dyn PricingFetcher,
    config: &CatalogConfig,
    gate: Option<&SyncGate>,
    cancel: &CancellationToken,
) -> CatalogResult<Option<Vec<StoredPricingEntry>>> {
    let last_sync = store.get_config(LAST_SYNC_CONFIG_KEY).await?;
    let now = chrono::Utc::now();
    if !should_sync_pricing(last_sync.as_ref().map(|e| e.value.as_str()), now, config.sync_interval()) {
        return Ok(None);
    }

    if let Some(gate) = gate {
        if !gate() {
            return Ok(None);
        }
    }

    if cancel.is_cancelled() {
        return Err(CatalogError::Cancelled);
    }

    let fetch_result = fetcher.fetch(&config.pricing_url, config.fetch_timeout()).await;

    let doc = match fetch_result {
        Ok(doc) => doc,
        Err(err) => {
            let existing = store.get_model_prices().await?;
            if existing.is_empty() {
                return Err(err);
            }
            tracing::warn!(error = %err, "pricing fetch failed, retaining stale cache");
            return Ok(None);
        }
    };

    let entries = parse_pricing_document(&doc)?;
    store
        .upsert_model_prices_transactional(entries)
        .await?;

    store
        .update_config(ConfigEntry {
            key: LAST_SYNC_CONFIG_KEY.to_string(),
            value: now.to_rfc3339(),
        })
        .await?;

    let rebuilt = store.get_model_prices().await?;
    Ok(Some(rebuilt))
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticFetcher {
        doc: serde_json::Value,
    }

    #[async_trait]
    impl PricingFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> CatalogResult<serde_json::Value> {
            Ok(self.doc.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl PricingFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> CatalogResult<serde_json::Value> {
            Err(CatalogError::TransientUpstream("HTTP 500".to_string()))
        }
    }

    #[test]
    fn should_sync_with_no_prior_record() {
        assert!(should_sync_pricing(None, Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn should_sync_with_unparseable_timestamp() {
        assert!(should_sync_pricing(
            Some("not-a-timestamp"),
            Utc::now(),
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn should_not_sync_within_interval() {
        let now = Utc::now();
        let recent = (now - ChronoDuration::seconds(10)).to_rfc3339();
        assert!(!should_sync_pricing(Some(&recent), now, Duration::from_secs(60)));
    }

    #[test]
    fn should_sync_after_interval_elapses() {
        let now = Utc::now();
        let stale = (now - ChronoDuration::seconds(120)).to_rfc3339();
        assert!(should_sync_pricing(Some(&stale), now, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn sc5_stale_cache_tolerance_on_fetch_failure() {
        let store = InMemoryPricingStore::new();
        store.seed(
            "gpt-4o",
            "openai",
            Mode::Chat,
            PricingRow {
                input_cost_per_token: Some(0.000005),
                ..Default::default()
            },
        );
        let config = CatalogConfig::default();
        let cancel = CancellationToken::new();

        let result = run_sync_tick(
            &store,
            None,
            &FailingFetcher,
            &config,
            None,
            &cancel,
        )
        .await;

        assert!(result.is_ok());
        let rows = store.get_model_prices().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.input_cost_per_token, Some(0.000005));
    }

    #[tokio::test]
    async fn fetch_failure_with_empty_store_surfaces_error() {
        let store = InMemoryPricingStore::new();
        let config = CatalogConfig::default();
        let cancel = CancellationToken::new();

        let result = run_sync_tick(&store, None, &FailingFetcher, &config, None, &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gate_function_skips_tick() {
        let store = InMemoryPricingStore::new();
        let doc = serde_json::json!({ "gpt-4o": { "provider": "openai", "mode": "chat", "input_cost_per_token": 1.0 } });
        let fetcher = StaticFetcher { doc };
        let config = CatalogConfig::default();
        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let gate: SyncGate = Arc::new(move || {
            ran_clone.store(true, Ordering::SeqCst);
            false
        });

        let result = run_sync_tick(&store, None, &fetcher, &config, Some(&gate), &cancel)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(ran.load(Ordering::SeqCst));
        assert!(store.get_model_prices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_sync_persists_timestamp_and_rows() {
        let store = InMemoryPricingStore::new();
        let doc = serde_json::json!({
            "openai/gpt-4o": { "provider": "openai", "mode": "chat", "input_cost_per_token": 0.000005 }
        });
        let fetcher = StaticFetcher { doc };
        let config = CatalogConfig::default();
        let cancel = CancellationToken::new();

        let rebuilt = run_sync_tick(&store, None, &fetcher, &config, None, &cancel)
            .await
            .unwrap()
            .expect("sync should have run");
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].model, "gpt-4o");

        let last_sync = store.get_config(LAST_SYNC_CONFIG_KEY).await.unwrap();
        assert!(last_sync.is_some());
    }

    #[tokio::test]
    async fn distributed_lock_acquire_and_release_round_trips() {
        let manager = LocalLockManager::new();
        let cancel = CancellationToken::new();
        let lock = manager.new_lock(PRICING_SYNC_LOCK_NAME).await;
        lock.lock(&cancel).await.unwrap();
        lock.unlock(&cancel).await.unwrap();
        // A second acquisition after release must succeed promptly.
        let lock2 = manager.new_lock(PRICING_SYNC_LOCK_NAME).await;
        lock2.lock(&cancel).await.unwrap();
    }
}
