// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The app metadata cache.
//!
//! Lookups hit an in-memory map first and fall back to a remote fetch that is written through to
//! the durable store. Two optional background tasks keep the cache fresh: a
//! full invalidation that swaps the whole map, and a reset of the missing-app bucket used as a
//! negative cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{canonical_guid, App, CacheEntry};
use crate::client::AppClient;
use crate::errors::{CacheError, StoreError};
use crate::populate::{BulkPopulator, APP_BUCKET};
use crate::store::KvStore;

pub const MISSING_APP_BUCKET: &str = "MissingAppBucket";
const MISSING_SENTINEL: &[u8] = b"1";

/// Metadata resolution for the event router.
#[async_trait]
pub trait AppResolver: Send + Sync {
    async fn get_app(&self, guid: &str) -> Result<App, CacheError>;

    /// A copy of every cached app keyed by guid.
    async fn get_all_apps(&self) -> Result<HashMap<String, App>, CacheError>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Period of the full invalidation and base TTL of each entry. Zero disables both.
    pub cache_invalidate_ttl: Duration,
    pub ignore_missing_apps: bool,
    /// Period of the missing-app bucket reset. Zero disables it.
    pub missing_app_cache_ttl: Duration,
    pub strip_app_suffixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_invalidate_ttl: Duration::from_secs(60),
            ignore_missing_apps: false,
            missing_app_cache_ttl: Duration::from_secs(3600),
            strip_app_suffixes: Vec::new(),
        }
    }
}

type AppMap = HashMap<String, CacheEntry>;

pub struct AppCache {
    config: CacheConfig,
    client: Arc<dyn AppClient>,
    store: Arc<dyn KvStore>,
    populator: BulkPopulator,
    apps: Arc<RwLock<AppMap>>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    suppressed: Arc<AtomicU64>,
}

impl std::fmt::Debug for AppCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppCache {
    pub fn new(config: CacheConfig, client: Arc<dyn AppClient>, store: Arc<dyn KvStore>) -> Self {
        let cancel_token = CancellationToken::new();
        let populator = BulkPopulator::new(
            Arc::clone(&client),
            Arc::clone(&store),
            config.cache_invalidate_ttl,
            config.strip_app_suffixes.clone(),
            cancel_token.clone(),
        );
        AppCache {
            config,
            client,
            store,
            populator,
            apps: Arc::new(RwLock::new(HashMap::new())),
            cancel_token,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opens the store and seeds the map from it, or from a full remote fetch when the store holds
    /// no usable entries. Storage failures are fatal.
    pub async fn open(&self) -> Result<(), CacheError> {
        self.store.open()?;
        self.store.create_bucket_if_not_exists(APP_BUCKET)?;
        self.store.create_bucket_if_not_exists(MISSING_APP_BUCKET)?;

        let mut apps = self.populator.read_back()?;
        if apps.is_empty() {
            info!("App store is empty, fetching all apps");
            match self.populator.populate().await {
                Ok(fetched) => apps = fetched,
                Err(CacheError::Storage(e)) => return Err(CacheError::Storage(e)),
                Err(e) => warn!("Initial app fetch failed, apps will be resolved lazily: {e}"),
            }
        }
        info!("App cache loaded with {} apps", apps.len());
        *self.apps.write().await = apps;

        let mut tasks = self.tasks.lock().await;
        if !self.config.cache_invalidate_ttl.is_zero() {
            tasks.push(tokio::spawn(invalidate_periodically(
                self.populator.clone(),
                Arc::clone(&self.apps),
                self.config.cache_invalidate_ttl,
                self.cancel_token.clone(),
            )));
        }
        if self.config.ignore_missing_apps && !self.config.missing_app_cache_ttl.is_zero() {
            tasks.push(tokio::spawn(reset_missing_periodically(
                Arc::clone(&self.store),
                Arc::clone(&self.suppressed),
                self.config.missing_app_cache_ttl,
                self.cancel_token.clone(),
            )));
        }
        Ok(())
    }

    /// Runs one full invalidation: refetches everything and swaps the map. Returns the new size.
    pub async fn invalidate(&self) -> Result<usize, CacheError> {
        let fresh = self.populator.populate().await?;
        let count = fresh.len();
        *self.apps.write().await = fresh;
        Ok(count)
    }

    /// Forgets every suppressed guid so their lookups reach the remote API again.
    pub fn reset_missing_apps(&self) -> Result<(), CacheError> {
        reset_missing_bucket(self.store.as_ref(), &self.suppressed)?;
        Ok(())
    }

    /// Lookups answered from the missing-app bucket since the last reset.
    #[must_use]
    pub fn suppressed_lookups(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Stops the background tasks, waits for them, then closes the store. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("Cache task failed: {e}");
            }
        }
        self.store.close()?;
        debug!("App cache closed");
        Ok(())
    }

    fn is_missing(&self, guid: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(MISSING_APP_BUCKET, guid)?.is_some())
    }

    fn record_missing(&self, guid: &str) {
        if let Err(e) = self.store.put(MISSING_APP_BUCKET, guid, MISSING_SENTINEL) {
            warn!("Failed to record missing app {guid}: {e}");
        }
    }
}

#[async_trait]
impl AppResolver for AppCache {
    async fn get_app(&self, guid: &str) -> Result<App, CacheError> {
        let guid = canonical_guid(guid)?;
        if let Some(entry) = self.apps.read().await.get(&guid) {
            if !entry.is_expired(SystemTime::now()) {
                return Ok(entry.app.clone());
            }
        }

        if self.config.ignore_missing_apps && self.is_missing(&guid)? {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!("Suppressed lookup of missing app {guid}");
            return Err(CacheError::NotFound(guid));
        }

        match self.client.app_by_guid(&guid).await {
            Ok(app) => {
                let mut app = self.populator.normalise(app);
                app.guid.clone_from(&guid);
                let entry = if self.closed.load(Ordering::SeqCst) {
                    CacheEntry::new(app.clone(), self.config.cache_invalidate_ttl)
                } else {
                    match self.populator.write_through(app.clone()) {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!("Failed to store app {guid}: {e}");
                            CacheEntry::new(app.clone(), self.config.cache_invalidate_ttl)
                        }
                    }
                };
                self.apps.write().await.insert(guid, entry);
                Ok(app)
            }
            Err(e) if self.config.ignore_missing_apps => {
                warn!("App {guid} not found, ignoring it until the next missing-app reset: {e}");
                self.record_missing(&guid);
                Err(CacheError::NotFound(guid))
            }
            Err(e) => Err(CacheError::Upstream(e)),
        }
    }

    async fn get_all_apps(&self) -> Result<HashMap<String, App>, CacheError> {
        Ok(self
            .apps
            .read()
            .await
            .iter()
            .map(|(guid, entry)| (guid.clone(), entry.app.clone()))
            .collect())
    }
}

fn reset_missing_bucket(store: &dyn KvStore, suppressed: &AtomicU64) -> Result<(), StoreError> {
    store.clear_bucket(MISSING_APP_BUCKET)?;
    let count = suppressed.swap(0, Ordering::Relaxed);
    if count > 0 {
        warn!("Suppressed {count} lookups of missing apps since the last reset");
    }
    Ok(())
}

async fn invalidate_periodically(
    populator: BulkPopulator,
    apps: Arc<RwLock<AppMap>>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel_token.cancelled() => break,
        }
        // populate joins all of its writers before returning, so close() never races a write
        match populator.populate().await {
            Ok(fresh) => {
                let count = fresh.len();
                *apps.write().await = fresh;
                debug!("App cache invalidated, {count} apps");
            }
            Err(e) => warn!("App cache invalidation failed, keeping current apps: {e}"),
        }
    }
    debug!("App cache invalidation stopped");
}

async fn reset_missing_periodically(
    store: Arc<dyn KvStore>,
    suppressed: Arc<AtomicU64>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel_token.cancelled() => break,
        }
        match reset_missing_bucket(store.as_ref(), &suppressed) {
            Ok(()) => debug!("Missing app bucket reset"),
            Err(e) => warn!("Failed to reset missing app bucket: {e}"),
        }
    }
    debug!("Missing app reset stopped");
}

/// Resolver used when no selected event type carries an app id.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyResolver;

#[async_trait]
impl AppResolver for EmptyResolver {
    async fn get_app(&self, guid: &str) -> Result<App, CacheError> {
        Err(CacheError::NotFound(guid.to_string()))
    }

    async fn get_all_apps(&self) -> Result<HashMap<String, App>, CacheError> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppSummary, Org, Space};
    use crate::errors::ClientError;
    use crate::store::MemoryStore;
    use tracing_test::traced_test;

    struct NoApps;

    #[async_trait]
    impl AppClient for NoApps {
        async fn app_by_guid(&self, _guid: &str) -> Result<App, ClientError> {
            Err(ClientError::NotFound)
        }

        async fn list_orgs(&self) -> Result<Vec<Org>, ClientError> {
            Err(ClientError::Status(503))
        }

        async fn org_spaces(&self, _org_guid: &str) -> Result<Vec<Space>, ClientError> {
            Ok(Vec::new())
        }

        async fn space_summary(&self, _space_guid: &str) -> Result<Vec<AppSummary>, ClientError> {
            Ok(Vec::new())
        }
    }

    fn cache(ignore_missing_apps: bool) -> AppCache {
        AppCache::new(
            CacheConfig {
                cache_invalidate_ttl: Duration::ZERO,
                ignore_missing_apps,
                missing_app_cache_ttl: Duration::ZERO,
                strip_app_suffixes: Vec::new(),
            },
            Arc::new(NoApps),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_survives_failed_bulk_fetch() {
        let cache = cache(false);
        cache.open().await.unwrap();
        assert!(logs_contain("Initial app fetch failed"));
        assert!(cache.get_all_apps().await.unwrap().is_empty());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_app_is_recorded() {
        let cache = cache(true);
        cache.open().await.unwrap();
        let guid = "6E8B4D47-3D5C-4F5D-9D1A-0E4C7A1B2C3D";
        assert!(matches!(
            cache.get_app(guid).await,
            Err(CacheError::NotFound(_))
        ));
        assert!(logs_contain("not found, ignoring it"));
        assert!(cache
            .is_missing("6e8b4d47-3d5c-4f5d-9d1a-0e4c7a1b2c3d")
            .unwrap());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_suppressed_lookups_are_counted_and_reported() {
        let cache = cache(true);
        cache.open().await.unwrap();
        let guid = "6e8b4d47-3d5c-4f5d-9d1a-0e4c7a1b2c3d";
        for _ in 0..4 {
            cache.get_app(guid).await.unwrap_err();
        }
        // the first lookup reached the API, the other three were suppressed
        assert_eq!(cache.suppressed_lookups(), 3);

        cache.reset_missing_apps().unwrap();
        assert!(logs_contain(
            "Suppressed 3 lookups of missing apps since the last reset"
        ));
        assert_eq!(cache.suppressed_lookups(), 0);
        assert!(!cache.is_missing(guid).unwrap());
        cache.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_bucket_stays_readable_during_resets() {
        let cache = Arc::new(cache(true));
        cache.open().await.unwrap();
        let guid = "6e8b4d47-3d5c-4f5d-9d1a-0e4c7a1b2c3d";

        let resetter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..500 {
                    cache.reset_missing_apps().unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut lookups = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            lookups.push(tokio::spawn(async move {
                for _ in 0..500 {
                    match cache.get_app(guid).await {
                        Err(CacheError::NotFound(_)) => {}
                        other => panic!("unexpected lookup result: {other:?}"),
                    }
                }
            }));
        }
        resetter.await.unwrap();
        for lookup in lookups {
            lookup.await.unwrap();
        }
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cache = cache(false);
        cache.open().await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_resolver() {
        let resolver = EmptyResolver;
        assert!(matches!(
            resolver.get_app("anything").await,
            Err(CacheError::NotFound(_))
        ));
        assert!(resolver.get_all_apps().await.unwrap().is_empty());
    }
}
