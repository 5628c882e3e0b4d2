//! Connectivity switch around another fetcher.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::{Fetch, NetError, Request, Response};

/// Wraps a fetcher and rejects every request while offline.
pub struct ConnectivityFetcher<F> {
    inner: F,
    online: AtomicBool,
}

impl<F: Fetch> ConnectivityFetcher<F> {
    /// Wrap `inner`, starting online.
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            online: AtomicBool::new(true),
        }
    }

    /// Toggle connectivity.
    pub fn set_online(&self, online: bool) {
        debug!(online, "Connectivity changed");
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether requests currently reach the inner fetcher.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: Fetch> Fetch for ConnectivityFetcher<F> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if !self.is_online() {
            return Err(NetError::Offline);
        }
        self.inner.fetch(request).await
    }
}
