//! # Enrichment Registry
//!
//! Shared, cached and de-duplicated access to enrichment providers.
//!
//! ```text
//! get(id, params)
//!   │ key = "<id>:" + (provider.cache_key(params) | json(params))
//!   ├─▶ cache hit (expires_at > now) ───────────────▶ value
//!   ├─▶ in-flight entry for key ──── attach ────────▶ shared result
//!   └─▶ provider.resolve(params) ── cache if ttl>0 ─▶ value
//!                                └─ always clears the in-flight entry
//! ```
//!
//! Failures are handed to every attached caller and never cached.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, instrument, trace, warn};

use super::{
    providers::ProviderDefinition,
    types::{EnrichmentProvider, Params, ProviderError, ProviderInfo, ProviderResult},
};
use crate::guard::lock;

type PendingResolve = Shared<BoxFuture<'static, ProviderResult<Value>>>;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub cache_ttl: Option<Duration>,
}

impl GetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache_ttl: Some(ttl),
        }
    }
}

pub struct EnrichmentRegistry {
    providers: DashMap<String, Arc<dyn EnrichmentProvider>>,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    inflight: Arc<Mutex<HashMap<String, PendingResolve>>>,
    refresh_tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    default_ttl: Duration,
}

impl EnrichmentRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            refresh_tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            default_ttl,
        }
    }

    pub fn with_providers(
        default_ttl: Duration,
        providers: impl IntoIterator<Item = Arc<dyn EnrichmentProvider>>,
    ) -> Self {
        let registry = Self::new(default_ttl);
        for provider in providers {
            registry.register(provider);
        }
        registry
    }

    /// Replacing a provider also drops the cache entries of the previous one.
    #[instrument(level = "debug", skip(self, provider), fields(id = provider.id()))]
    pub fn register(&self, provider: Arc<dyn EnrichmentProvider>) {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), provider).is_some() {
            self.clear_cache(Some(&id));
        }
    }

    /// Builds a provider from its definition and registers it. When the registry is
    /// already started, the provider is initialised and its refresh timer armed.
    pub async fn install(&self, definition: ProviderDefinition) -> ProviderResult<()> {
        let provider = definition.build()?;
        self.register(provider.clone());
        if self.started.load(Ordering::SeqCst) {
            self.activate(provider).await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.providers.remove(id).is_some();
        self.clear_cache(Some(id));
        removed
    }

    pub fn provider(&self, id: &str) -> Option<Arc<dyn EnrichmentProvider>> {
        self.providers.get(id).map(|entry| entry.value().clone())
    }

    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self
            .providers
            .iter()
            .map(|entry| ProviderInfo::of(entry.value().as_ref()))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn cache_size(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Clears every entry, or only those namespaced to `provider_id`.
    pub fn clear_cache(&self, provider_id: Option<&str>) {
        let mut cache = lock(&self.cache);
        match provider_id {
            None => cache.clear(),
            Some(id) => {
                let prefix = format!("{}:", id);
                cache.retain(|key, _| !key.starts_with(&prefix));
            }
        }
    }

    pub async fn get(
        &self,
        provider_id: &str,
        params: &Params,
        options: GetOptions,
    ) -> ProviderResult<Value> {
        let provider = self
            .provider(provider_id)
            .ok_or_else(|| ProviderError::UnknownSource(provider_id.to_string()))?;
        let key = cache_key(provider.as_ref(), params);

        if let Some(value) = self.cached(&key) {
            trace!("Enrichment cache hit: {}", key);
            return Ok(value);
        }

        let pending = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(pending) => {
                    trace!("Enrichment joined in-flight request: {}", key);
                    pending.clone()
                }
                None => {
                    // A resolve may have finished between the cache check and here.
                    if let Some(value) = self.cached(&key) {
                        return Ok(value);
                    }
                    let ttl = options
                        .cache_ttl
                        .or_else(|| provider.ttl())
                        .unwrap_or(self.default_ttl);
                    let pending = self.spawn_resolve(provider, params.clone(), key.clone(), ttl);
                    inflight.insert(key.clone(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let cache = lock(&self.cache);
        cache
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn spawn_resolve(
        &self,
        provider: Arc<dyn EnrichmentProvider>,
        params: Params,
        key: String,
        ttl: Duration,
    ) -> PendingResolve {
        let cache = self.cache.clone();
        let inflight = self.inflight.clone();
        async move {
            let started = Instant::now();
            let result = provider.resolve(&params).await;
            match &result {
                Ok(value) if !ttl.is_zero() => {
                    lock(&cache).insert(
                        key.clone(),
                        CacheEntry {
                            value: value.clone(),
                            expires_at: started + ttl,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => debug!("Enrichment {} failed: {}", provider.id(), e),
            }
            lock(&inflight).remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Initialises every provider and arms refresh timers.
    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let providers: Vec<Arc<dyn EnrichmentProvider>> = self
            .providers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for provider in providers {
            self.activate(provider).await;
        }
    }

    async fn activate(&self, provider: Arc<dyn EnrichmentProvider>) {
        if let Err(e) = provider.init().await {
            warn!("Enrichment provider {} failed to init: {}", provider.id(), e);
        }
        let Some(interval) = provider.refresh_interval().filter(|i| !i.is_zero()) else {
            return;
        };
        if !provider.supports_refresh() {
            return;
        }
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = provider.refresh().await {
                    warn!("Enrichment provider {} refresh failed: {}", provider.id(), e);
                }
            }
        });
        lock(&self.refresh_tasks).push(task);
    }

    #[instrument(level = "debug", skip(self))]
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for task in lock(&self.refresh_tasks).drain(..) {
            task.abort();
        }
    }

    /// Reloads one provider now and drops its cached values.
    pub async fn refresh(&self, provider_id: &str) -> ProviderResult<()> {
        let provider = self
            .provider(provider_id)
            .ok_or_else(|| ProviderError::UnknownSource(provider_id.to_string()))?;
        if !provider.supports_refresh() {
            return Err(ProviderError::RefreshUnsupported(provider_id.to_string()));
        }
        provider.refresh().await?;
        self.clear_cache(Some(provider_id));
        Ok(())
    }
}

impl Drop for EnrichmentRegistry {
    fn drop(&mut self) {
        for task in lock(&self.refresh_tasks).drain(..) {
            task.abort();
        }
    }
}

fn cache_key(provider: &dyn EnrichmentProvider, params: &Params) -> String {
    match provider.cache_key(params) {
        Some(custom) => format!("{}:{}", provider.id(), custom),
        None => format!("{}:{}", provider.id(), Value::Object(params.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        id: String,
        calls: AtomicUsize,
        ttl: Option<Duration>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(id: &str, ttl: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                ttl,
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                ttl: None,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnrichmentProvider for CountingProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn ttl(&self) -> Option<Duration> {
            self.ttl
        }

        async fn resolve(&self, params: &Params) -> ProviderResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(ProviderError::Failed("boom".to_string()));
            }
            Ok(json!({ "call": n, "params": params }))
        }
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        let err = registry
            .get("nope", &Params::new(), GetOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown_enrichment_source:nope");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let provider = CountingProvider::new("geo", None);
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(provider.clone());
        let p = params(json!({"ip": "1.1.1.1"}));

        let (a, b) = tokio::join!(
            registry.get("geo", &p, GetOptions::default()),
            registry.get("geo", &p, GetOptions::default())
        );

        assert_eq!(provider.calls(), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let provider = CountingProvider::new("geo", Some(Duration::from_millis(1000)));
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(provider.clone());
        let p = params(json!({"ip": "1.1.1.1"}));

        registry.get("geo", &p, GetOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.get("geo", &p, GetOptions::default()).await.unwrap();
        assert_eq!(provider.calls(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        registry.get("geo", &p, GetOptions::default()).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_override_skips_cache() {
        let provider = CountingProvider::new("geo", None);
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(provider.clone());
        let p = params(json!({"ip": "1.1.1.1"}));

        for _ in 0..2 {
            registry
                .get("geo", &p, GetOptions::with_ttl(Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(provider.calls(), 2);
        assert_eq!(registry.cache_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_not_cached() {
        let provider = CountingProvider::failing("flaky");
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(provider.clone());

        for _ in 0..2 {
            let result = registry.get("flaky", &Params::new(), GetOptions::default()).await;
            assert!(result.is_err());
        }
        assert_eq!(provider.calls(), 2);
        assert_eq!(registry.cache_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_by_provider() {
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(CountingProvider::new("a", None));
        registry.register(CountingProvider::new("ab", None));
        registry.get("a", &Params::new(), GetOptions::default()).await.unwrap();
        registry.get("ab", &Params::new(), GetOptions::default()).await.unwrap();
        assert_eq!(registry.cache_size(), 2);

        registry.clear_cache(Some("a"));
        assert_eq!(registry.cache_size(), 1);

        assert!(registry.unregister("ab"));
        assert_eq!(registry.cache_size(), 0);
    }

    #[tokio::test]
    async fn test_refresh_unsupported() {
        let registry = EnrichmentRegistry::new(Duration::from_secs(60));
        registry.register(CountingProvider::new("a", None));
        let result = registry.refresh("a").await;
        assert!(matches!(result, Err(ProviderError::RefreshUnsupported(_))));
    }
}
