/**
 * Server Initialization
 *
 * Builds every long-lived component, spawns the background tasks and
 * assembles the router.
 *
 * # Initialization Process
 *
 * 1. Validate configuration
 * 2. Load the store (Postgres, or memory as a fallback)
 * 3. Create clock and cache
 * 4. Wire hub, delivery, queue, resolver and controller into `AppState`
 * 5. Spawn hub maintenance, reap accounting, cache janitor and retry loop
 * 6. Create the router
 *
 * # Shutdown
 *
 * `App::shutdown` flips the shutdown signal, waits for the retry loop to
 * finish its current sweep, then shuts the hub down so no session is
 * written to while it is closing.
 */

#[cfg(feature = "ssr")]
use axum::Router;
#[cfg(feature = "ssr")]
use std::sync::Arc;
#[cfg(feature = "ssr")]
use std::time::Duration;
#[cfg(feature = "ssr")]
use tokio::sync::watch;
#[cfg(feature = "ssr")]
use tokio::task::JoinHandle;

#[cfg(feature = "ssr")]
use crate::backend::cache::MemoryCache;
#[cfg(feature = "ssr")]
use crate::backend::routes::router::create_router;
#[cfg(feature = "ssr")]
use crate::backend::runtime::{SharedClock, SystemClock};
#[cfg(feature = "ssr")]
use crate::backend::server::config::load_store;
#[cfg(feature = "ssr")]
use crate::backend::server::state::AppState;
#[cfg(feature = "ssr")]
use crate::backend::store::SharedStore;
#[cfg(feature = "ssr")]
use crate::backend::sync::RetryLoop;
#[cfg(feature = "ssr")]
use crate::shared::{AppConfig, ConfigError};

/// A running application: router plus the tasks behind it
#[cfg(feature = "ssr")]
pub struct App {
    pub router: Router<()>,
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    retry: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

/// Create and configure the application
///
/// A missing or unreachable database does not fail startup; the server
/// runs on the in-memory store instead. Only invalid configuration is an
/// error.
#[cfg(feature = "ssr")]
pub async fn create_app(config: AppConfig) -> Result<App, ConfigError> {
    tracing::info!("[Server] Initializing hubsync backend");

    // Step 1: Reject bad configuration before anything is spawned
    config.validate()?;

    // Step 2: Persistence
    let store = load_store(&config.database).await;

    // Step 3: Clock and cache
    let clock: SharedClock = Arc::new(SystemClock::new());
    let cache = Arc::new(MemoryCache::new(clock.clone()));

    Ok(App::start(config, store, cache, clock))
}

#[cfg(feature = "ssr")]
impl App {
    /// Wire state over the given components and spawn background tasks
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: AppConfig,
        store: SharedStore,
        cache: Arc<MemoryCache>,
        clock: SharedClock,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Step 4: Components
        let state = AppState::build(config, store, cache.clone(), clock, shutdown_rx.clone());

        // Step 5: Background tasks
        let janitor_every = state.config.session.reap_interval;
        let background = vec![
            state.hub.spawn_maintenance(shutdown_rx.clone()),
            state.delivery.spawn_reap_accounting(shutdown_rx.clone()),
            spawn_cache_janitor(cache, janitor_every, shutdown_rx.clone()),
        ];
        let retry = RetryLoop::new(state.controller.clone(), state.config.retry.sweep_interval)
            .spawn(shutdown_rx);

        // Step 6: Router
        let router = create_router(state.clone());

        tracing::info!(
            "[Server] Router configured; sweeping every {:?}, pinging every {:?}",
            state.config.retry.sweep_interval,
            state.config.session.ping_interval
        );

        Self {
            router,
            state,
            shutdown_tx,
            retry,
            background,
        }
    }

    /// Signal, drain the retry loop, then close the hub
    pub async fn shutdown(self) {
        tracing::info!("[Server] Shutting down");
        // Receivers live in the tasks; a send error only means they are gone
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.retry.await {
            tracing::error!("[Server] Retry loop ended abnormally: {}", e);
        }

        let detached = self.state.hub.shutdown().await;

        for task in self.background {
            if let Err(e) = task.await {
                tracing::error!("[Server] Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("[Server] Shutdown complete ({} sessions detached)", detached);
    }
}

/// Periodically evict expired cache entries
#[cfg(feature = "ssr")]
fn spawn_cache_janitor(
    cache: Arc<MemoryCache>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = cache.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!("[Server] Purged {} expired cache entries", purged);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
