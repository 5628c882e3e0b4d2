//! # Animart Service Worker
//!
//! Offline worker runtime for the Animart marketplace PWA.
//!
//! ## Features
//!
//! - **Asset cache store**: named cache generations keyed by method + URL
//! - **Lifecycle**: install (pre-cache manifest), activate (evict stale
//!   generations), fetch (cache-first or network-first)
//! - **Registration**: installing → waiting → active, skip-waiting and
//!   clients-claim
//! - **Push**: background payloads rendered as notifications
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration ── ServiceWorker (per generation)
//!     │                                    ├── LifecycleController
//!     │                                    └── PushHandler
//!     ├── Clients
//!     └── CacheStorage
//!             └── Cache (generation)
//!                     └── (method, URL) → Response
//! ```

use animart_common::AnimartError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod push;
pub mod registration;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage};
pub use config::{AssetManifest, CacheGeneration, FetchStrategy, WorkerConfig};
pub use lifecycle::{ActivateReport, FetchResponse, InstallReport, LifecycleController};
pub use push::{
    ChannelNotificationSink, LogNotificationSink, Notification, NotificationSink, PushError,
    PushHandler, PushPayload,
};
pub use registration::{
    Client, ClientType, Clients, FetchEvent, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Common(#[from] AnimartError),
}
