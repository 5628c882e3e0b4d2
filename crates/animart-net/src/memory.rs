//! In-memory origin.
//!
//! Serves a fixed set of resources without touching the network. Used by
//! hosts that bundle their shell assets, and by tests that need to count
//! how often the network path was taken.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;

use crate::{Fetch, NetError, Request, Response};

#[derive(Debug, Clone)]
struct Resource {
    status: StatusCode,
    body: Bytes,
}

/// A fake origin keyed by absolute URL.
#[derive(Debug, Default)]
pub struct MemoryOrigin {
    resources: RwLock<HashMap<String, Resource>>,
    hits: RwLock<HashMap<String, usize>>,
    total_hits: AtomicUsize,
}

impl MemoryOrigin {
    /// Create an empty origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with 200 OK at `url`, replacing any previous resource.
    pub async fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.serve_status(url, StatusCode::OK, body).await;
    }

    /// Serve `body` with an explicit status at `url`.
    pub async fn serve_status(&self, url: &str, status: StatusCode, body: impl Into<Bytes>) {
        self.resources.write().await.insert(
            url.to_string(),
            Resource {
                status,
                body: body.into(),
            },
        );
    }

    /// Stop serving `url`; later fetches get 404.
    pub async fn remove(&self, url: &str) -> bool {
        self.resources.write().await.remove(url).is_some()
    }

    /// Number of fetches received for `url`.
    pub async fn hits(&self, url: &str) -> usize {
        self.hits.read().await.get(url).copied().unwrap_or(0)
    }

    /// Number of fetches received overall.
    pub fn total_hits(&self) -> usize {
        self.total_hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for MemoryOrigin {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        self.total_hits.fetch_add(1, Ordering::SeqCst);
        *self.hits.write().await.entry(key.clone()).or_insert(0) += 1;

        if request.method != Method::GET && request.method != Method::HEAD {
            return Ok(Response::new(
                request.url.clone(),
                StatusCode::METHOD_NOT_ALLOWED,
                Bytes::new(),
            ));
        }

        let resources = self.resources.read().await;
        let response = match resources.get(&key) {
            Some(resource) => {
                Response::new(request.url.clone(), resource.status, resource.body.clone())
            }
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND, Bytes::new()),
        };

        trace!(url = %request.url, status = %response.status, "Served from memory origin");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_and_counts() {
        let origin = MemoryOrigin::new();
        origin.serve("https://shop.test/index.html", "<html>").await;

        let request = Request::parse("https://shop.test/index.html").unwrap();
        let response = origin.fetch(&request).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.text().unwrap(), "<html>");
        assert_eq!(origin.hits("https://shop.test/index.html").await, 1);
        assert_eq!(origin.total_hits(), 1);
    }

    #[tokio::test]
    async fn test_unknown_url_is_not_found() {
        let origin = MemoryOrigin::new();
        let request = Request::parse("https://shop.test/nope.css").unwrap();
        let response = origin.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_is_rejected_with_status() {
        let origin = MemoryOrigin::new();
        origin.serve("https://shop.test/api", "{}").await;

        let request = Request::parse("https://shop.test/api")
            .unwrap()
            .method(Method::POST);
        let response = origin.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
