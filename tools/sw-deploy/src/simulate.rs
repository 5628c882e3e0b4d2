//! Deploy simulation.
//!
//! Registers a worker against an origin, then cuts the network and replays
//! navigations to see what the installed generation can serve offline.

use std::sync::Arc;

use animart_net::{ConnectivityFetcher, Fetch};
use animart_sw::{
    FetchEvent, LogNotificationSink, ServiceWorkerContainer, ServiceWorkerError, WorkerConfig,
};
use tracing::{info, warn};

/// Outcome of one offline navigation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Probe {
    /// Root-relative path navigated to.
    pub path: String,
    /// Whether the path is part of the manifest.
    pub in_manifest: bool,
    /// Response status, if anything was served.
    pub status: Option<u16>,
    /// Whether the response came from cache.
    pub from_cache: bool,
    /// Failure, if nothing was served.
    pub error: Option<String>,
}

/// Simulation report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimulationReport {
    pub generation: String,
    pub strategy: String,
    pub installed: bool,
    pub install_error: Option<String>,
    /// Cache generations left after activation.
    pub caches: Vec<String>,
    pub probes: Vec<Probe>,
}

impl SimulationReport {
    /// Install succeeded and every manifest entry was served from cache offline.
    pub fn passed(&self) -> bool {
        self.installed
            && self
                .probes
                .iter()
                .filter(|p| p.in_manifest)
                .all(|p| p.from_cache)
    }
}

/// Error type for simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulateError {
    #[error("Invalid probe path {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Worker(#[from] ServiceWorkerError),
}

/// Run install/activate with `fetcher` online, then probe `extra` paths plus
/// the manifest offline.
pub async fn simulate<F: Fetch + 'static>(
    config: WorkerConfig,
    fetcher: F,
    extra: &[String],
) -> Result<SimulationReport, SimulateError> {
    let network = Arc::new(ConnectivityFetcher::new(fetcher));
    let (container, _events) =
        ServiceWorkerContainer::new(Arc::clone(&network) as _, Arc::new(LogNotificationSink));

    let generation = config.cache_name.to_string();
    let strategy = config.strategy.to_string();
    let origin = config.origin.clone();
    let manifest: Vec<String> = config.manifest.entries().to_vec();

    let (installed, install_error) = match container.register(config).await {
        Ok(_) => (true, None),
        Err(e) => {
            warn!(error = %e, "Install failed");
            (false, Some(e.to_string()))
        }
    };

    network.set_online(false);
    info!(%generation, "Network cut, probing offline");

    let mut probes = Vec::new();
    let paths = manifest
        .iter()
        .map(|p| (p, true))
        .chain(extra.iter().filter(|p| !manifest.contains(p)).map(|p| (p, false)));
    for (path, in_manifest) in paths {
        let url = origin
            .join(path)
            .map_err(|_| SimulateError::InvalidPath(path.clone()))?;
        let probe = match container.dispatch_fetch(FetchEvent::navigation(url)).await {
            Ok(served) => Probe {
                path: path.clone(),
                in_manifest,
                status: Some(served.response.status.as_u16()),
                from_cache: served.from_cache,
                error: None,
            },
            Err(e) => Probe {
                path: path.clone(),
                in_manifest,
                status: None,
                from_cache: false,
                error: Some(e.to_string()),
            },
        };
        probes.push(probe);
    }

    let caches = container.caches.read().await.keys();

    Ok(SimulationReport {
        generation,
        strategy,
        installed,
        install_error,
        caches,
        probes,
    })
}
