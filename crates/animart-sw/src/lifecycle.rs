//! Lifecycle controller: install, activate and fetch handling for one worker.

use std::sync::Arc;

use animart_common::with_timeout;
use animart_net::{Fetch, Request, Response};
use futures::future::{join_all, try_join_all};
use http::Method;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, CacheStorage};
use crate::config::{CacheGeneration, FetchStrategy, WorkerConfig};
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: CacheGeneration,
    pub cached: usize,
}

/// Result of an activation sweep.
///
/// `failed` lists stale generations that could not be deleted (already gone
/// by the time their deletion ran). They do not fail activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    /// Whether from cache.
    pub from_cache: bool,
}

impl FetchResponse {
    fn cached(response: Response) -> Self {
        Self {
            response,
            from_cache: true,
        }
    }

    pub(crate) fn network(response: Response) -> Self {
        Self {
            response,
            from_cache: false,
        }
    }
}

/// Drives cache population, eviction and request interception.
pub struct LifecycleController {
    config: Arc<WorkerConfig>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetch>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Current generation.
    pub fn generation(&self) -> &CacheGeneration {
        &self.config.cache_name
    }

    /// Strategy this worker was started with.
    pub fn strategy(&self) -> FetchStrategy {
        self.config.strategy
    }

    fn runtime_cache(&self) -> Option<String> {
        self.config
            .runtime_caching
            .then(|| self.config.cache_name.runtime_name())
    }

    fn is_current(&self, name: &str) -> bool {
        name == self.config.cache_name.as_str()
            || self.runtime_cache().as_deref() == Some(name)
    }

    /// Install: fetch every manifest asset and store them in the current
    /// generation as one batch.
    ///
    /// Any failed or non-2xx fetch fails the install and nothing from this
    /// attempt is kept.
    #[instrument(skip(self), fields(generation = %self.config.cache_name))]
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let name = self.config.cache_name.as_str();
        let urls = self.config.manifest_urls()?;

        let created = {
            let mut caches = self.caches.write().await;
            let existed = caches.has(name);
            caches.open(name);
            !existed
        };

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            match self.fetcher.fetch(&request).await {
                Ok(response) if response.ok() => Ok((CacheKey::for_request(&request), response)),
                Ok(response) => Err(ServiceWorkerError::InstallFailed(format!(
                    "{} responded {}",
                    request.url, response.status
                ))),
                Err(e) => Err(ServiceWorkerError::InstallFailed(format!(
                    "{}: {}",
                    request.url, e
                ))),
            }
        });

        match try_join_all(fetches).await {
            Ok(staged) => {
                let cached = staged.len();
                self.caches.write().await.open(name).put_all(staged);
                info!(cached, "Install complete");
                Ok(InstallReport {
                    generation: self.config.cache_name.clone(),
                    cached,
                })
            }
            Err(e) => {
                let mut caches = self.caches.write().await;
                if created && caches.get(name).map_or(true, |c| c.is_empty()) {
                    caches.delete(name);
                }
                warn!(error = %e, "Install failed");
                Err(e)
            }
        }
    }

    /// Activate: delete every cache generation other than the current one.
    ///
    /// Deletions run concurrently; this returns once all of them settled.
    #[instrument(skip(self), fields(generation = %self.config.cache_name))]
    pub async fn activate(&self) -> ActivateReport {
        let stale: Vec<String> = self
            .caches
            .read()
            .await
            .keys()
            .into_iter()
            .filter(|name| !self.is_current(name))
            .collect();

        let report = sweep(&self.caches, stale).await;
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Activation sweep complete"
        );
        report
    }

    /// Answer an intercepted request using the configured strategy.
    #[instrument(skip(self, request), fields(url = %request.url, strategy = %self.config.strategy))]
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        match self.config.strategy {
            FetchStrategy::CacheFirst => {
                if let Some(response) = self.lookup(request).await {
                    debug!("Cache hit");
                    return Ok(FetchResponse::cached(response));
                }
                let response = self.network(request).await?;
                self.store_runtime(request, &response).await;
                Ok(FetchResponse::network(response))
            }
            FetchStrategy::NetworkFirst => match self.network(request).await {
                Ok(response) => {
                    self.store_runtime(request, &response).await;
                    Ok(FetchResponse::network(response))
                }
                Err(e) => match self.lookup(request).await {
                    Some(response) => {
                        debug!(error = %e, "Network failed, serving cached copy");
                        Ok(FetchResponse::cached(response))
                    }
                    None => Err(e),
                },
            },
        }
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let runtime = self.runtime_cache();
        let mut names = vec![self.config.cache_name.as_str()];
        if let Some(ref runtime) = runtime {
            names.push(runtime.as_str());
        }

        self.caches
            .read()
            .await
            .match_in(&names, request)
            .map(|entry| entry.response.clone())
    }

    async fn network(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let failed = |reason: String| ServiceWorkerError::FetchFailed {
            url: request.url.to_string(),
            reason,
        };

        match self.config.network_timeout() {
            Some(timeout) => with_timeout(timeout, || self.fetcher.fetch(request))
                .await
                .map_err(|e| failed(e.to_string()))?
                .map_err(|e| failed(e.to_string())),
            None => self
                .fetcher
                .fetch(request)
                .await
                .map_err(|e| failed(e.to_string())),
        }
    }

    async fn store_runtime(&self, request: &Request, response: &Response) {
        let Some(runtime) = self.runtime_cache() else {
            return;
        };
        if request.method != Method::GET || !response.ok() {
            return;
        }

        self.caches
            .write()
            .await
            .open(&runtime)
            .put(CacheKey::for_request(request), response.clone());
        debug!(cache = %runtime, "Stored runtime response");
    }
}

/// Delete `names` concurrently and wait for every deletion to settle.
async fn sweep(caches: &Arc<RwLock<CacheStorage>>, names: Vec<String>) -> ActivateReport {
    let deletions = names.into_iter().map(|name| {
        let caches = Arc::clone(caches);
        async move {
            let deleted = caches.write().await.delete(&name);
            (name, deleted)
        }
    });

    let mut report = ActivateReport::default();
    for (name, deleted) in join_all(deletions).await {
        if deleted {
            debug!(cache = %name, "Deleted stale generation");
            report.deleted.push(name);
        } else {
            warn!(cache = %name, "Stale generation vanished before deletion");
            report.failed.push(name);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetManifest;
    use animart_net::{ConnectivityFetcher, MemoryOrigin, Url};
    use http::StatusCode;
    use std::time::Duration;

    const ORIGIN: &str = "https://shop.test";

    fn config(generation: &str, manifest: &[&str], strategy: FetchStrategy) -> WorkerConfig {
        WorkerConfig::new(
            Url::parse(ORIGIN).unwrap(),
            CacheGeneration::new(generation).unwrap(),
            AssetManifest::new(manifest.iter().copied()),
        )
        .with_strategy(strategy)
    }

    async fn origin_with(paths: &[&str]) -> Arc<ConnectivityFetcher<MemoryOrigin>> {
        let origin = MemoryOrigin::new();
        for path in paths {
            origin
                .serve(&format!("{ORIGIN}{path}"), format!("v1 {path}"))
                .await;
        }
        Arc::new(ConnectivityFetcher::new(origin))
    }

    fn controller(
        config: WorkerConfig,
        caches: &Arc<RwLock<CacheStorage>>,
        fetcher: Arc<ConnectivityFetcher<MemoryOrigin>>,
    ) -> LifecycleController {
        LifecycleController::new(Arc::new(config), Arc::clone(caches), fetcher)
    }

    fn request(path: &str) -> Request {
        Request::parse(&format!("{ORIGIN}{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_install_caches_every_manifest_entry() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/index.html", "/app.js"]).await;
        let ctl = controller(
            config("animart-v1", &["/", "/index.html", "/app.js"], FetchStrategy::CacheFirst),
            &caches,
            fetcher,
        );

        let report = ctl.install().await.unwrap();
        assert_eq!(report.cached, 3);

        let storage = caches.read().await;
        let cache = storage.get("animart-v1").unwrap();
        for path in ["/", "/index.html", "/app.js"] {
            assert!(cache.match_request(&request(path)).is_some(), "{path} not cached");
        }
    }

    #[tokio::test]
    async fn test_install_is_atomic_on_missing_asset() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/index.html"]).await;
        let ctl = controller(
            config("animart-v1", &["/", "/index.html", "/missing.css"], FetchStrategy::CacheFirst),
            &caches,
            fetcher,
        );

        let err = ctl.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(!caches.read().await.has("animart-v1"));
    }

    #[tokio::test]
    async fn test_install_fails_offline_and_keeps_existing_generation() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        caches.write().await.open("animart-v1").put(
            CacheKey::get(&Url::parse("https://shop.test/").unwrap()),
            Response::new(Url::parse("https://shop.test/").unwrap(), StatusCode::OK, "old"),
        );
        let fetcher = origin_with(&["/"]).await;
        fetcher.set_online(false);
        let ctl = controller(config("animart-v1", &["/"], FetchStrategy::CacheFirst), &caches, fetcher);

        assert!(ctl.install().await.is_err());
        assert_eq!(caches.read().await.get("animart-v1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_evicts_stale_generations() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        {
            let mut storage = caches.write().await;
            storage.open("animart-v0");
            storage.open("animart-v1");
            storage.open("thumbnails");
            storage.open("animart-v2");
        }
        let fetcher = origin_with(&["/"]).await;
        let ctl = controller(config("animart-v2", &["/"], FetchStrategy::CacheFirst), &caches, fetcher);

        let report = ctl.activate().await;
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(caches.read().await.keys(), vec!["animart-v2"]);
    }

    #[tokio::test]
    async fn test_sweep_reports_vanished_generation() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        caches.write().await.open("animart-v0");

        let report = sweep(
            &caches,
            vec!["animart-v0".to_string(), "animart-gone".to_string()],
        )
        .await;

        assert_eq!(report.deleted, vec!["animart-v0"]);
        assert_eq!(report.failed, vec!["animart-gone"]);
        assert!(caches.read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_activate_keeps_runtime_cache_when_enabled() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        {
            let mut storage = caches.write().await;
            storage.open("animart-v1-runtime");
            storage.open("animart-v2");
            storage.open("animart-v2-runtime");
        }
        let fetcher = origin_with(&["/"]).await;
        let mut cfg = config("animart-v2", &["/"], FetchStrategy::CacheFirst);
        cfg.runtime_caching = true;
        let ctl = controller(cfg, &caches, fetcher);

        let report = ctl.activate().await;
        assert_eq!(report.deleted, vec!["animart-v1-runtime"]);
        assert_eq!(
            caches.read().await.keys(),
            vec!["animart-v2", "animart-v2-runtime"]
        );
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/index.html"]).await;
        let ctl = controller(
            config("animart-v1", &["/", "/index.html"], FetchStrategy::CacheFirst),
            &caches,
            Arc::clone(&fetcher),
        );
        ctl.install().await.unwrap();
        let after_install = fetcher.inner().total_hits();

        for _ in 0..3 {
            let served = ctl.handle_fetch(&request("/index.html")).await.unwrap();
            assert!(served.from_cache);
            assert_eq!(served.response.text().unwrap(), "v1 /index.html");
        }
        assert_eq!(fetcher.inner().total_hits(), after_install);
    }

    #[tokio::test]
    async fn test_cache_first_miss_goes_to_network_without_storing() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/listing/42"]).await;
        let ctl = controller(config("animart-v1", &["/"], FetchStrategy::CacheFirst), &caches, Arc::clone(&fetcher));
        ctl.install().await.unwrap();

        let served = ctl.handle_fetch(&request("/listing/42")).await.unwrap();
        assert!(!served.from_cache);
        assert!(caches
            .read()
            .await
            .match_request(&request("/listing/42"))
            .is_none());

        fetcher.set_online(false);
        assert!(matches!(
            ctl.handle_fetch(&request("/listing/42")).await,
            Err(ServiceWorkerError::FetchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_network_first_prefers_network() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/"]).await;
        let ctl = controller(config("animart-v1", &["/"], FetchStrategy::NetworkFirst), &caches, Arc::clone(&fetcher));
        ctl.install().await.unwrap();

        fetcher.inner().serve("https://shop.test/", "v2 /").await;
        let served = ctl.handle_fetch(&request("/")).await.unwrap();
        assert!(!served.from_cache);
        assert_eq!(served.response.text().unwrap(), "v2 /");
    }

    #[tokio::test]
    async fn test_network_first_error_status_is_not_a_failure() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/"]).await;
        let ctl = controller(config("animart-v1", &["/"], FetchStrategy::NetworkFirst), &caches, Arc::clone(&fetcher));
        ctl.install().await.unwrap();

        fetcher.inner().remove("https://shop.test/").await;
        let served = ctl.handle_fetch(&request("/")).await.unwrap();
        assert!(!served.from_cache);
        assert_eq!(served.response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_network_first_offline_falls_back_to_cache() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/index.html"]).await;
        let ctl = controller(
            config("animart-v1", &["/", "/index.html"], FetchStrategy::NetworkFirst),
            &caches,
            Arc::clone(&fetcher),
        );
        ctl.install().await.unwrap();
        fetcher.set_online(false);

        let served = ctl.handle_fetch(&request("/index.html")).await.unwrap();
        assert!(served.from_cache);

        assert!(matches!(
            ctl.handle_fetch(&request("/cart")).await,
            Err(ServiceWorkerError::FetchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_runtime_caching_makes_visited_pages_available_offline() {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = origin_with(&["/", "/listing/7"]).await;
        let mut cfg = config("animart-v1", &["/"], FetchStrategy::NetworkFirst);
        cfg.runtime_caching = true;
        let ctl = controller(cfg, &caches, Arc::clone(&fetcher));
        ctl.install().await.unwrap();

        ctl.handle_fetch(&request("/listing/7")).await.unwrap();
        fetcher.set_online(false);

        let served = ctl.handle_fetch(&request("/listing/7")).await.unwrap();
        assert!(served.from_cache);
        assert!(caches.read().await.has("animart-v1-runtime"));
    }

    #[tokio::test]
    async fn test_network_timeout_falls_back() {
        struct Hanging;

        #[async_trait::async_trait]
        impl Fetch for Hanging {
            async fn fetch(&self, _request: &Request) -> Result<Response, animart_net::NetError> {
                futures::future::pending().await
            }
        }

        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        caches.write().await.open("animart-v1").put(
            CacheKey::get(&Url::parse("https://shop.test/").unwrap()),
            Response::new(Url::parse("https://shop.test/").unwrap(), StatusCode::OK, "cached"),
        );
        let mut cfg = config("animart-v1", &["/"], FetchStrategy::NetworkFirst);
        cfg.network_timeout_ms = Some(20);
        let ctl = LifecycleController::new(Arc::new(cfg), Arc::clone(&caches), Arc::new(Hanging));

        let served = tokio::time::timeout(Duration::from_secs(2), ctl.handle_fetch(&request("/")))
            .await
            .unwrap()
            .unwrap();
        assert!(served.from_cache);
    }
}
