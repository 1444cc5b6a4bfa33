use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::server::metrics::{FailOpenReason, WebhookMetrics};
use crate::server::oci::Reference;
use crate::server::transform::{
    cache::{Mapping, MappingCache},
    harbor::{harbor_host, HarborClient, ProxyResolver},
    models::DynamicConfig,
    retarget, ContainerTransformer, NotReady, TransformError,
};

const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(5);

type Snapshot = Arc<HashMap<String, String>>;

/// A mapping fetch that any number of callers can await
type SharedFetch = Shared<BoxFuture<'static, Result<Snapshot, Arc<anyhow::Error>>>>;

/// Transformer that discovers proxy-cache projects from Harbor
///
/// Mappings are cached per source host. A cache miss triggers a resolution
/// bounded by the configured timeout; if it fails or times out the image is
/// left unchanged so pods stay schedulable while Harbor is degraded.
///
/// At most one fetch against Harbor runs at a time. Cache misses and the
/// periodic refresh that arrive while a fetch is running await that fetch.
pub struct DynamicTransformer {
    cache: Arc<MappingCache>,
    resolver: Arc<dyn ProxyResolver>,
    inflight: Arc<Mutex<Option<SharedFetch>>>,
    metrics: Arc<WebhookMetrics>,
    ready: AtomicBool,
    harbor_host: String,
    timeout: Duration,
    refresh_interval: Duration,
    bootstrap_timeout: Duration,
}

impl DynamicTransformer {
    /// Create a new dynamic transformer talking to the configured Harbor instance
    pub fn new(config: DynamicConfig, metrics: Arc<WebhookMetrics>) -> Result<Self> {
        let resolver = Arc::new(HarborClient::new(&config)?);
        Self::with_resolver(&config, resolver, metrics)
    }

    /// Create a dynamic transformer with a custom mapping source
    pub fn with_resolver(
        config: &DynamicConfig,
        resolver: Arc<dyn ProxyResolver>,
        metrics: Arc<WebhookMetrics>,
    ) -> Result<Self> {
        Ok(Self {
            cache: Arc::new(MappingCache::new(config.cache_ttl())),
            resolver,
            inflight: Arc::new(Mutex::new(None)),
            metrics,
            ready: AtomicBool::new(false),
            harbor_host: harbor_host(&config.endpoint)?,
            timeout: config.timeout(),
            refresh_interval: config.refresh_interval(),
            bootstrap_timeout: config.bootstrap_timeout(),
        })
    }

    /// Start the bootstrap and refresh loop
    ///
    /// The returned task only finishes if bootstrap fails, in which case it
    /// yields the error that should stop the process.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            self.bootstrap().await?;
            self.refresh_loop().await;
            Ok(())
        })
    }

    /// Retry full syncs until one succeeds or the bootstrap deadline passes
    async fn bootstrap(&self) -> Result<()> {
        let deadline = Instant::now() + self.bootstrap_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.sync().await {
                Ok(count) => {
                    self.ready.store(true, Ordering::Release);
                    info!(
                        "Dynamic transformer ready with {} proxy mappings from {} (attempt {})",
                        count, self.harbor_host, attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        bail!(
                            "Initial proxy mapping sync with {} did not succeed within {:?} ({} attempts): {:#}",
                            self.harbor_host,
                            self.bootstrap_timeout,
                            attempt,
                            e
                        );
                    }
                    warn!(
                        attempt,
                        error = %format!("{:#}", e),
                        "Initial proxy mapping sync failed, retrying"
                    );
                    sleep(BOOTSTRAP_RETRY_DELAY.min(deadline - now)).await;
                }
            }
        }
    }

    /// Periodic full refresh; failures keep the previous mappings
    async fn refresh_loop(&self) {
        info!(
            "Proxy mapping refresh loop started (interval {:?})",
            self.refresh_interval
        );
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and bootstrap just synced
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.sync().await {
                Ok(count) => {
                    let cached_hosts = self.cache.len().await;
                    debug!(cached_hosts, "Refreshed {} proxy mappings", count);
                }
                Err(e) => error!("Error refreshing proxy mappings: {:#}", e),
            }
        }
    }

    /// Fetch the full mapping set and swap it into the cache
    async fn sync(&self) -> Result<usize> {
        let snapshot = self.fetch().await.map_err(|e| anyhow!("{:#}", e))?;
        Ok(snapshot.len())
    }

    /// Join the running fetch, or start one if none is running
    ///
    /// The fetch runs in its own task and applies its snapshot to the cache,
    /// so it completes even when every caller has stopped waiting.
    fn fetch(&self) -> SharedFetch {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fetch) = inflight.as_ref() {
            // A finished fetch is only left behind if its task panicked
            if fetch.peek().is_none() {
                return fetch.clone();
            }
        }

        let cache = Arc::clone(&self.cache);
        let resolver = Arc::clone(&self.resolver);
        let slot = Arc::clone(&self.inflight);
        let task = tokio::spawn(async move {
            let result = match resolver.fetch_mappings().await {
                Ok(snapshot) => {
                    cache.apply_snapshot(&snapshot).await;
                    Ok(Arc::new(snapshot))
                }
                Err(e) => Err(Arc::new(e)),
            };
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
            result
        });

        let fetch = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(Arc::new(anyhow!("Proxy mapping fetch task failed: {}", e)))
                })
            })
            .boxed()
            .shared();
        *inflight = Some(fetch.clone());
        fetch
    }

    /// Resolve a single host on behalf of a request
    async fn resolve(&self, host: &str) -> Option<Mapping> {
        match timeout(self.timeout, self.fetch()).await {
            Ok(Ok(snapshot)) => match snapshot.get(host) {
                Some(destination) => Some(Mapping::Proxied(destination.clone())),
                None => {
                    self.cache.mark_unmapped(host).await;
                    Some(Mapping::Unmapped)
                }
            },
            Ok(Err(e)) => {
                warn!(
                    host,
                    error = %format!("{:#}", e),
                    "Proxy mapping resolution failed, leaving image unchanged"
                );
                self.metrics.record_fail_open(FailOpenReason::Error);
                None
            }
            Err(_) => {
                warn!(
                    host,
                    timeout = ?self.timeout,
                    "Proxy mapping resolution timed out, leaving image unchanged"
                );
                self.metrics.record_fail_open(FailOpenReason::Timeout);
                None
            }
        }
    }
}

#[async_trait]
impl ContainerTransformer for DynamicTransformer {
    async fn transform(&self, image: &Reference) -> Result<Option<Reference>, TransformError> {
        let host = image.registry();

        // Images already served by Harbor never need a lookup
        if host == self.harbor_host {
            return Ok(None);
        }

        let mapping = match self.cache.get(host).await {
            Some(mapping) => mapping,
            None => match self.resolve(host).await {
                Some(mapping) => mapping,
                None => return Ok(None),
            },
        };

        match mapping {
            Mapping::Unmapped => Ok(None),
            Mapping::Proxied(destination) => {
                let target_name = format!("{}/{}", destination, image.repository());
                let target = retarget(image, &target_name)?;
                if let Some(target) = &target {
                    debug!("Rewriting {} to {}", image, target);
                }
                Ok(target)
            }
        }
    }

    fn ready(&self) -> Result<(), NotReady> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NotReady(format!(
                "initial proxy mapping sync with {} has not completed",
                self.harbor_host
            )))
        }
    }

    fn transformer_type(&self) -> &str {
        "dynamic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::oci::parse_image;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    /// Resolver returning a replaceable mapping set, optionally failing or stalling
    struct FakeResolver {
        mappings: Mutex<HashMap<String, String>>,
        fail: AtomicBool,
        delay: Duration,
        calls: AtomicUsize,
    }

    fn pairs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    impl FakeResolver {
        fn new(mappings: &[(&str, &str)]) -> Self {
            Self {
                mappings: Mutex::new(pairs(mappings)),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            let resolver = Self::new(&[]);
            resolver.fail.store(true, Ordering::SeqCst);
            resolver
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn set(&self, mappings: &[(&str, &str)]) {
            *self.mappings.lock().unwrap() = pairs(mappings);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProxyResolver for FakeResolver {
        async fn fetch_mappings(&self) -> Result<HashMap<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            Ok(self.mappings.lock().unwrap().clone())
        }
    }

    fn config() -> DynamicConfig {
        DynamicConfig {
            endpoint: "https://harbor.example.com".to_string(),
            username: None,
            password: None,
            refresh_interval_secs: 300,
            timeout_ms: 200,
            cache_ttl_secs: 600,
            bootstrap_timeout_secs: 0,
        }
    }

    fn transformer_with(config: &DynamicConfig, resolver: Arc<FakeResolver>) -> DynamicTransformer {
        DynamicTransformer::with_resolver(
            config,
            resolver,
            Arc::new(WebhookMetrics::new().unwrap()),
        )
        .unwrap()
    }

    fn transformer(resolver: Arc<FakeResolver>) -> DynamicTransformer {
        transformer_with(&config(), resolver)
    }

    async fn rewrite(transformer: &DynamicTransformer, spec: &str) -> Option<String> {
        transformer
            .transform(&parse_image(spec).unwrap())
            .await
            .unwrap()
            .map(|target| target.to_string())
    }

    #[tokio::test]
    async fn test_rewrites_mapped_host() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = transformer(resolver);

        assert_eq!(
            rewrite(&transformer, "nginx:1.21").await.as_deref(),
            Some("harbor.example.com/proxy-dockerhub/library/nginx:1.21")
        );
    }

    #[tokio::test]
    async fn test_unmapped_host_is_cached_as_negative() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = transformer(resolver.clone());

        assert_eq!(rewrite(&transformer, "ghcr.io/org/tool:1.0").await, None);
        assert_eq!(rewrite(&transformer, "ghcr.io/org/tool:1.0").await, None);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_reused() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "quay.io",
            "harbor.example.com/proxy-quay",
        )]));
        let transformer = transformer(resolver.clone());

        rewrite(&transformer, "quay.io/org/app:v1").await;
        let second = rewrite(&transformer, "quay.io/org/app:v2").await;

        assert_eq!(
            second.as_deref(),
            Some("harbor.example.com/proxy-quay/org/app:v2")
        );
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_triggers_resolution() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "quay.io",
            "harbor.example.com/proxy-quay",
        )]));
        let transformer = transformer(resolver.clone());

        rewrite(&transformer, "quay.io/org/app:v1").await;
        tokio::time::advance(Duration::from_secs(601)).await;
        rewrite(&transformer, "quay.io/org/app:v1").await;

        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_negative_entry_is_resolved_again() {
        let resolver = Arc::new(FakeResolver::new(&[]));
        let transformer = transformer(resolver.clone());

        assert_eq!(rewrite(&transformer, "ghcr.io/org/tool:1.0").await, None);

        // Harbor gains a proxy project; the negative entry holds until it expires
        resolver.set(&[("ghcr.io", "harbor.example.com/proxy-ghcr")]);
        assert_eq!(rewrite(&transformer, "ghcr.io/org/tool:1.0").await, None);
        assert_eq!(resolver.calls(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;

        assert_eq!(
            rewrite(&transformer, "ghcr.io/org/tool:1.0").await.as_deref(),
            Some("harbor.example.com/proxy-ghcr/org/tool:1.0")
        );
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let resolver = Arc::new(
            FakeResolver::new(&[("docker.io", "harbor.example.com/proxy-dockerhub")])
                .with_delay(Duration::from_millis(100)),
        );
        let transformer = transformer(resolver.clone());

        let results = join_all((0..20).map(|_| rewrite(&transformer, "nginx:1.21"))).await;

        assert_eq!(resolver.calls(), 1);
        for result in results {
            assert_eq!(
                result.as_deref(),
                Some("harbor.example.com/proxy-dockerhub/library/nginx:1.21")
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_is_repeated_after_the_previous_one_finishes() {
        let resolver = Arc::new(FakeResolver::new(&[]));
        let transformer = transformer(resolver.clone());

        rewrite(&transformer, "ghcr.io/org/tool:1.0").await;
        rewrite(&transformer, "quay.io/org/app:v1").await;

        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_resolver_fails_open() {
        let metrics = Arc::new(WebhookMetrics::new().unwrap());
        let transformer = DynamicTransformer::with_resolver(
            &config(),
            Arc::new(FakeResolver::failing()),
            metrics.clone(),
        )
        .unwrap();

        let result = transformer
            .transform(&parse_image("unmapped.example.com/app:1").unwrap())
            .await;

        assert!(matches!(result, Ok(None)));
        assert!(metrics
            .render()
            .unwrap()
            .contains(r#"proxy_webhook_resolution_fail_open_total{reason="error"} 1"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_resolver_fails_open_and_populates_later() {
        let mut cfg = config();
        cfg.timeout_ms = 20;
        let resolver = Arc::new(
            FakeResolver::new(&[("docker.io", "harbor.example.com/proxy-dockerhub")])
                .with_delay(Duration::from_millis(100)),
        );
        let metrics = Arc::new(WebhookMetrics::new().unwrap());
        let transformer =
            DynamicTransformer::with_resolver(&cfg, resolver.clone(), metrics.clone()).unwrap();

        assert_eq!(rewrite(&transformer, "nginx:1.21").await, None);
        assert!(metrics
            .render()
            .unwrap()
            .contains(r#"proxy_webhook_resolution_fail_open_total{reason="timeout"} 1"#));

        sleep(Duration::from_millis(200)).await;

        assert_eq!(
            rewrite(&transformer, "nginx:1.21").await.as_deref(),
            Some("harbor.example.com/proxy-dockerhub/library/nginx:1.21")
        );
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_harbor_images_skip_lookup() {
        let resolver = Arc::new(FakeResolver::new(&[]));
        let transformer = transformer(resolver.clone());

        assert_eq!(
            rewrite(&transformer, "harbor.example.com/proxy-dockerhub/library/nginx:1.21").await,
            None
        );
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_until_bootstrap() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = transformer(resolver);

        assert!(transformer.ready().is_err());
        transformer.bootstrap().await.unwrap();
        assert!(transformer.ready().is_ok());
    }

    #[tokio::test]
    async fn test_per_host_failure_after_bootstrap_keeps_ready() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = transformer(resolver.clone());
        transformer.bootstrap().await.unwrap();

        resolver.fail.store(true, Ordering::SeqCst);
        assert_eq!(rewrite(&transformer, "quay.io/org/app:v1").await, None);
        assert!(transformer.ready().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries_until_sync_succeeds() {
        let mut cfg = config();
        cfg.bootstrap_timeout_secs = 60;
        let resolver = Arc::new(FakeResolver::failing());
        let transformer = Arc::new(transformer_with(&cfg, resolver.clone()));

        let task = Arc::clone(&transformer).start();
        sleep(Duration::from_secs(7)).await;
        assert!(transformer.ready().is_err());

        resolver.fail.store(false, Ordering::SeqCst);
        sleep(Duration::from_secs(5)).await;

        assert!(transformer.ready().is_ok());
        assert_eq!(resolver.calls(), 3);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_marks_removed_host_unmapped() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = Arc::new(transformer(resolver.clone()));
        let task = Arc::clone(&transformer).start();

        while transformer.ready().is_err() {
            sleep(Duration::from_millis(1)).await;
        }
        assert!(rewrite(&transformer, "nginx:1.21").await.is_some());

        // The proxy project is removed from Harbor before the next refresh
        resolver.set(&[]);
        sleep(Duration::from_secs(301)).await;

        assert_eq!(rewrite(&transformer, "nginx:1.21").await, None);
        assert_eq!(resolver.calls(), 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_mappings() {
        let resolver = Arc::new(FakeResolver::new(&[(
            "docker.io",
            "harbor.example.com/proxy-dockerhub",
        )]));
        let transformer = Arc::new(transformer(resolver.clone()));
        let task = Arc::clone(&transformer).start();

        while transformer.ready().is_err() {
            sleep(Duration::from_millis(1)).await;
        }
        resolver.fail.store(true, Ordering::SeqCst);
        sleep(Duration::from_secs(301)).await;

        assert_eq!(resolver.calls(), 2);
        assert_eq!(
            rewrite(&transformer, "nginx:1.21").await.as_deref(),
            Some("harbor.example.com/proxy-dockerhub/library/nginx:1.21")
        );
        assert!(transformer.ready().is_ok());
        task.abort();
    }

    #[tokio::test]
    async fn test_bootstrap_fails_after_deadline() {
        let transformer = transformer(Arc::new(FakeResolver::failing()));

        let result = transformer.bootstrap().await;

        assert!(result.is_err());
        assert!(transformer.ready().is_err());
    }

    #[tokio::test]
    async fn test_start_reports_bootstrap_failure() {
        let transformer = Arc::new(transformer(Arc::new(FakeResolver::failing())));

        let result = transformer.start().await.unwrap();

        assert!(result.is_err());
    }
}
