/**
 * Store Loading
 *
 * Picks the persistence backend from `[database]`. With a URL the server
 * connects to Postgres and runs migrations; without one, or when the
 * connection fails, it logs a warning and runs on the in-memory store.
 *
 * Migration failures are logged but do not stop startup, since the schema
 * may already be current.
 */

#[cfg(feature = "ssr")]
use std::sync::Arc;

#[cfg(feature = "ssr")]
use crate::backend::store::{MemoryStore, PgStore, SharedStore};
#[cfg(feature = "ssr")]
use crate::shared::config::DatabaseConfig;

/// Connect the configured store, falling back to memory
#[cfg(feature = "ssr")]
pub async fn load_store(config: &DatabaseConfig) -> SharedStore {
    let database_url = match config.url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => url,
        None => {
            tracing::warn!("[Store] DATABASE_URL not set. Using the in-memory store; data will not survive a restart.");
            return Arc::new(MemoryStore::new());
        }
    };

    tracing::info!("[Store] Connecting to database...");

    let store = match PgStore::connect(database_url, config.max_connections).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("[Store] Failed to create database connection pool: {}", e);
            tracing::warn!("[Store] Falling back to the in-memory store.");
            return Arc::new(MemoryStore::new());
        }
    };

    tracing::info!("[Store] Running database migrations...");
    match store.migrate().await {
        Ok(()) => tracing::info!("[Store] Database migrations completed successfully"),
        Err(e) => {
            tracing::error!("[Store] Failed to run database migrations: {}", e);
            tracing::warn!("[Store] Continuing without migrations - database might not be up to date");
        }
    }

    Arc::new(store)
}
