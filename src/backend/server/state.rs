/**
 * Application State Management
 *
 * `AppState` is the single state container handed to every Axum handler.
 * Each component inside it is cheap to clone (an `Arc` or a handle that
 * wraps one), so cloning the state per request only bumps refcounts.
 *
 * # State Extraction
 *
 * The `FromRef` implementations let a handler take just the piece it
 * needs, e.g. `State(hub): State<Hub>`, instead of the whole state.
 */

#[cfg(feature = "ssr")]
use axum::extract::FromRef;
#[cfg(feature = "ssr")]
use std::sync::Arc;
#[cfg(feature = "ssr")]
use tokio::sync::watch;

#[cfg(feature = "ssr")]
use crate::backend::cache::SharedCache;
#[cfg(feature = "ssr")]
use crate::backend::delivery::DeliveryService;
#[cfg(feature = "ssr")]
use crate::backend::realtime::Hub;
#[cfg(feature = "ssr")]
use crate::backend::runtime::{IdSource, SharedClock};
#[cfg(feature = "ssr")]
use crate::backend::store::SharedStore;
#[cfg(feature = "ssr")]
use crate::backend::sync::{ConflictResolver, OperationQueue, SyncController};
#[cfg(feature = "ssr")]
use crate::shared::AppConfig;

/// Application state shared by every handler
///
/// # Fields
///
/// * `config` - Validated configuration the server started with
/// * `clock` - Time source; tests swap in a `ManualClock`
/// * `ids` - Monotonic id generator used for sync tokens
/// * `store` - Postgres or in-memory persistence
/// * `cache` - Presence and system-channel key-value cache
/// * `hub` - Live session registry
/// * `delivery` - Typed sending API over the hub
/// * `controller` - Per-user sync runs and conflict resolution
#[cfg(feature = "ssr")]
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub clock: SharedClock,
    pub ids: Arc<IdSource>,
    pub store: SharedStore,
    pub cache: SharedCache,
    pub hub: Hub,
    pub delivery: DeliveryService,
    pub controller: Arc<SyncController>,
}

#[cfg(feature = "ssr")]
impl AppState {
    /// Wire every component over the given store, cache and clock
    ///
    /// `shutdown` is the receiver sync runs poll between operations; flip
    /// its sender to stop in-progress drains at the next op boundary.
    pub fn build(
        config: AppConfig,
        store: SharedStore,
        cache: SharedCache,
        clock: SharedClock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ids = Arc::new(IdSource::new(clock.clone()));
        let hub = Hub::new(config.session.clone(), clock.clone(), cache.clone());
        let delivery = DeliveryService::new(
            hub.clone(),
            store.clone(),
            cache.clone(),
            clock.clone(),
            config.delivery.clone(),
        );
        let queue = Arc::new(OperationQueue::new(
            store.clone(),
            clock.clone(),
            config.sync.clone(),
            &config.retry,
        ));
        let resolver = Arc::new(ConflictResolver::new(&config.resolver));
        let controller = Arc::new(SyncController::new(
            queue,
            resolver,
            delivery.clone(),
            clock.clone(),
            ids.clone(),
            shutdown,
        ));

        Self {
            config: Arc::new(config),
            clock,
            ids,
            store,
            cache,
            hub,
            delivery,
            controller,
        }
    }
}

#[cfg(feature = "ssr")]
impl FromRef<AppState> for Hub {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.hub.clone()
    }
}

#[cfg(feature = "ssr")]
impl FromRef<AppState> for DeliveryService {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.delivery.clone()
    }
}

#[cfg(feature = "ssr")]
impl FromRef<AppState> for Arc<SyncController> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.controller.clone()
    }
}

#[cfg(feature = "ssr")]
impl FromRef<AppState> for SharedStore {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.store.clone()
    }
}

#[cfg(feature = "ssr")]
impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.config.clone()
    }
}
