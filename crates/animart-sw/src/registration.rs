//! Worker registration: lifecycle states, controlled clients, and the
//! container that hosts workers and routes events to them.
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration (scope)
//!     │       ├── installing ──install()──▶ waiting ──activate()──▶ active
//!     │       └── (failed install / superseded) ──▶ redundant
//!     ├── Clients (open pages, each with an optional controller)
//!     └── CacheStorage (shared by every worker generation)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use animart_common::OptionExt;
use animart_net::{Fetch, Request, Url};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::{CacheGeneration, WorkerConfig};
use crate::lifecycle::{FetchResponse, LifecycleController};
use crate::push::{Notification, NotificationSink, PushHandler};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Cache generation this worker owns.
    pub generation: CacheGeneration,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, generation: CacheGeneration) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            generation,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker (activating or activated).
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Start installing `worker`. Returns a worker it superseded, now redundant.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        retire(self.installing.replace(worker))
    }

    /// Mark the installing worker redundant after a failed install.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        retire(self.installing.take())
    }

    /// Transition installing to waiting. Returns a previously waiting
    /// worker, now redundant.
    pub fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installed);
                Ok(retire(self.waiting.replace(worker)))
            }
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(
                    "installing worker was superseded".to_string(),
                ))
            }
        }
    }

    /// Promote the waiting worker to active (activating). Returns its ID and
    /// the previously active worker, now redundant.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;
        let previous = retire(self.active.replace(worker));
        Some((id, previous))
    }

    /// Mark the active worker activated once its activate step settled.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut() {
            Some(worker) if worker.id == id && worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// No installing, waiting or active worker.
    pub fn is_empty(&self) -> bool {
        self.installing.is_none() && self.waiting.is_none() && self.active.is_none()
    }

    /// Worker that controls pages in scope.
    pub fn controller_id(&self) -> Option<ServiceWorkerId> {
        self.active.as_ref().map(|w| w.id)
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .filter_map(retire)
            .collect()
    }

    /// Whether `url` falls inside this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }
}

fn retire(worker: Option<ServiceWorker>) -> Option<ServiceWorker> {
    worker.map(|mut w| {
        w.set_state(ServiceWorkerState::Redundant);
        w
    })
}

// ==================== Client ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Options for clients.matchAll().
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match clients controlled by `worker` (plus uncontrolled ones if asked).
    pub fn match_all(&self, worker: ServiceWorkerId, options: ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == Some(worker))
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Clients currently controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> Vec<&Client> {
        self.match_all(
            worker,
            ClientMatchOptions {
                include_uncontrolled: false,
                client_type: ClientType::All,
            },
        )
    }

    /// Open a window.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        let id = format!("client-{}", uuid_simple());
        let client = Client {
            id: id.clone(),
            url,
            client_type: ClientType::Window,
            controller,
        };

        self.clients.insert(id, client.clone());
        client
    }

    /// Navigate a window client; its controller is re-resolved by the caller.
    pub fn navigate(
        &mut self,
        id: &str,
        url: Url,
        controller: Option<ServiceWorkerId>,
    ) -> Result<Client, ServiceWorkerError> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only navigate window clients".to_string(),
            ));
        }
        client.url = url;
        client.controller = controller;
        Ok(client.clone())
    }

    /// Close a client.
    pub fn close(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Make `worker` the controller of every client in `scope`. Returns the
    /// IDs whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }

    /// Move every client controlled by `from` to `to`.
    pub fn hand_over(&mut self, from: ServiceWorkerId, to: ServiceWorkerId) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.controller == Some(from))
            .map(|c| {
                c.controller = Some(to);
                c.id.clone()
            })
            .collect()
    }
}

// ==================== Events ====================

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// Intercepted request.
    pub request: Request,

    /// Client ID.
    pub client_id: Option<String>,
}

impl FetchEvent {
    /// Navigation to `url` (no originating client).
    pub fn navigation(url: Url) -> Self {
        Self {
            request: Request::navigate(url),
            client_id: None,
        }
    }

    /// Subresource request issued by a page.
    pub fn subresource(request: Request, client_id: impl Into<String>) -> Self {
        Self {
            request,
            client_id: Some(client_id.into()),
        }
    }
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Update found.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Service Worker Container ====================

#[derive(Clone)]
struct WorkerRuntime {
    config: Arc<WorkerConfig>,
    controller: Arc<LifecycleController>,
    push: Arc<PushHandler>,
}

/// Hosts the registration, its workers, open pages and cache storage.
pub struct ServiceWorkerContainer {
    registration: RwLock<Option<ServiceWorkerRegistration>>,

    runtimes: RwLock<HashMap<ServiceWorkerId, WorkerRuntime>>,

    /// Cache storage.
    pub caches: Arc<RwLock<CacheStorage>>,

    /// Clients.
    pub clients: Arc<RwLock<Clients>>,

    fetcher: Arc<dyn Fetch>,

    notifications: Arc<dyn NotificationSink>,

    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        notifications: Arc<dyn NotificationSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(None),
                runtimes: RwLock::new(HashMap::new()),
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                notifications,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    async fn with_registration<T>(
        &self,
        f: impl FnOnce(&mut ServiceWorkerRegistration) -> T,
    ) -> Result<T, ServiceWorkerError> {
        let mut guard = self.registration.write().await;
        let registration = guard
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::NotFound("no registration".to_string()))?;
        Ok(f(registration))
    }

    async fn runtime(&self, id: ServiceWorkerId) -> Option<WorkerRuntime> {
        self.runtimes.read().await.get(&id).cloned()
    }

    async fn retire_runtime(&self, worker: Option<ServiceWorker>) {
        if let Some(worker) = worker {
            self.runtimes.write().await.remove(&worker.id);
            self.emit_state(worker.id, ServiceWorkerState::Redundant);
        }
    }

    /// Register a worker built from `config` and run it through install and,
    /// when nothing holds it back, activation.
    ///
    /// A failed install leaves the previously active worker in charge.
    pub async fn register(
        &self,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        config.validate()?;
        let scope = config.scope_url()?;
        let script_url = config.script_url()?;
        let config = Arc::new(config);

        let runtime = WorkerRuntime {
            controller: Arc::new(LifecycleController::new(
                Arc::clone(&config),
                Arc::clone(&self.caches),
                Arc::clone(&self.fetcher),
            )),
            push: Arc::new(PushHandler::new(
                config.default_icon.clone(),
                Arc::clone(&self.notifications),
            )),
            config: Arc::clone(&config),
        };

        let worker = ServiceWorker::new(script_url, config.cache_name.clone());
        let id = worker.id;

        let superseded = {
            let mut guard = self.registration.write().await;
            let registration =
                guard.get_or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));
            if registration.scope != scope {
                return Err(ServiceWorkerError::SecurityError(format!(
                    "already registered for scope {}",
                    registration.scope
                )));
            }
            registration.begin_install(worker)
        };
        self.retire_runtime(superseded).await;
        self.runtimes.write().await.insert(id, runtime.clone());

        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope.to_string(),
        });
        self.emit_state(id, ServiceWorkerState::Installing);
        info!(
            worker = id.raw(),
            generation = %config.cache_name,
            strategy = %config.strategy,
            "Installing worker"
        );

        if let Err(e) = runtime.controller.install().await {
            let failed = {
                let mut guard = self.registration.write().await;
                let failed = guard.as_mut().and_then(|r| r.install_failed(id));
                if guard.as_ref().is_some_and(ServiceWorkerRegistration::is_empty) {
                    *guard = None;
                }
                failed
            };
            self.retire_runtime(failed).await;
            return Err(e);
        }

        let displaced = self
            .with_registration(|r| r.install_complete(id))
            .await??;
        self.retire_runtime(displaced).await;
        self.emit_state(id, ServiceWorkerState::Installed);

        if config.skip_waiting {
            debug!(worker = id.raw(), "Skipping waiting phase");
            self.activate_waiting().await?;
        } else if !self.active_has_clients().await {
            self.activate_waiting().await?;
        } else {
            info!(worker = id.raw(), "Installed, waiting for controlled pages to close");
        }

        Ok(id)
    }

    async fn active_has_clients(&self) -> bool {
        let active = self
            .registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.controller_id());
        match active {
            Some(id) => !self.clients.read().await.controlled_by(id).is_empty(),
            None => false,
        }
    }

    async fn activate_waiting(&self) -> Result<(), ServiceWorkerError> {
        let (id, previous) = self
            .with_registration(|r| r.begin_activation())
            .await?
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        self.emit_state(id, ServiceWorkerState::Activating);

        // A controlled page must always resolve to a live runtime.
        if let Some(previous_id) = previous.as_ref().map(|w| w.id) {
            let handed = self.clients.write().await.hand_over(previous_id, id);
            self.emit_controller_changes(handed, id);
        }
        self.retire_runtime(previous).await;

        let runtime = self
            .runtime(id)
            .await
            .ok_or_not_found(format!("worker {}", id.raw()))?;
        let report = runtime.controller.activate().await;

        if !self.with_registration(|r| r.finish_activation(id)).await? {
            return Err(ServiceWorkerError::StateError(
                "activating worker was superseded".to_string(),
            ));
        }
        self.emit_state(id, ServiceWorkerState::Activated);

        if runtime.config.clients_claim {
            let scope = runtime.config.scope_url()?;
            let claimed = self.clients.write().await.claim(id, &scope);
            self.emit_controller_changes(claimed, id);
        }

        info!(
            worker = id.raw(),
            evicted = report.deleted.len(),
            "Worker activated"
        );
        Ok(())
    }

    fn emit_controller_changes(&self, client_ids: Vec<String>, worker_id: ServiceWorkerId) {
        for client_id in client_ids {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            });
        }
    }

    /// Activate the waiting worker now, whatever pages are open.
    pub async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        self.activate_waiting().await
    }

    /// Open a page. Pages opened in scope are controlled by the active worker.
    pub async fn open_window(&self, url: &str) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url).map_err(|e| ServiceWorkerError::InvalidUrl(e.to_string()))?;
        let controller = self.controller_for(&url).await;
        Ok(self.clients.write().await.open_window(url, controller))
    }

    /// Reload a page, which picks up the current active worker.
    pub async fn reload(&self, client_id: &str) -> Result<Client, ServiceWorkerError> {
        let (url, before) = self
            .clients
            .read()
            .await
            .get(client_id)
            .map(|c| (c.url.clone(), c.controller))
            .ok_or_else(|| ServiceWorkerError::NotFound(client_id.to_string()))?;
        let controller = self.controller_for(&url).await;

        let client = self
            .clients
            .write()
            .await
            .navigate(client_id, url, controller)?;
        if let Some(worker_id) = client.controller.filter(|_| controller != before) {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client.id.clone(),
                worker_id,
            });
        }
        Ok(client)
    }

    /// Close a page. Closing the last page of the old worker lets a waiting
    /// worker activate.
    pub async fn close_window(&self, client_id: &str) -> Result<(), ServiceWorkerError> {
        self.clients
            .write()
            .await
            .close(client_id)
            .ok_or_else(|| ServiceWorkerError::NotFound(client_id.to_string()))?;

        let has_waiting = self
            .registration
            .read()
            .await
            .as_ref()
            .is_some_and(|r| r.waiting.is_some());
        if has_waiting && !self.active_has_clients().await {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    async fn controller_for(&self, url: &Url) -> Option<ServiceWorkerId> {
        let guard = self.registration.read().await;
        let registration = guard.as_ref()?;
        if registration.in_scope(url) {
            registration.controller_id()
        } else {
            None
        }
    }

    async fn handler_for(&self, event: &FetchEvent) -> Option<WorkerRuntime> {
        let worker_id = if event.request.is_navigation() {
            self.controller_for(&event.request.url).await?
        } else {
            let client_id = event.client_id.as_deref()?;
            self.clients.read().await.get(client_id)?.controller?
        };
        self.runtime(worker_id).await
    }

    /// Route a fetch through the controlling worker, or straight to the
    /// network when no worker controls it.
    pub async fn dispatch_fetch(
        &self,
        event: FetchEvent,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        match self.handler_for(&event).await {
            Some(runtime) => runtime.controller.handle_fetch(&event.request).await,
            None => {
                debug!(url = %event.request.url, "Not intercepted");
                self.fetcher
                    .fetch(&event.request)
                    .await
                    .map(FetchResponse::network)
                    .map_err(|e| ServiceWorkerError::FetchFailed {
                        url: event.request.url.to_string(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Deliver a push payload to the active worker.
    pub async fn dispatch_push(&self, payload: &[u8]) -> Result<Notification, ServiceWorkerError> {
        let active = self
            .registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.controller_id())
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))?;
        let runtime = self
            .runtime(active)
            .await
            .ok_or_not_found(format!("worker {}", active.raw()))?;

        runtime.push.handle(payload).map_err(|e| {
            warn!(worker = active.raw(), error = %e, "Push not shown");
            ServiceWorkerError::from(e)
        })
    }

    /// Unregister. Cache storage is left alone.
    pub async fn unregister(&self) -> Result<bool, ServiceWorkerError> {
        let Some(mut registration) = self.registration.write().await.take() else {
            return Ok(false);
        };
        for worker in registration.unregister() {
            self.retire_runtime(Some(worker)).await;
        }
        Ok(true)
    }

    /// Snapshot of the active worker.
    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration.read().await.as_ref()?.active.clone()
    }

    /// Snapshot of the waiting worker.
    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.registration.read().await.as_ref()?.waiting.clone()
    }

    /// Snapshot of the installing worker.
    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.registration.read().await.as_ref()?.installing.clone()
    }

    /// Snapshot of a client.
    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }
}

// ==================== Helpers ====================

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{:016x}-{:04x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
