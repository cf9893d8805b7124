//! In-memory application fixture
//!
//! Builds the same `AppState` and router the server uses, over
//! `MemoryStore`, `MemoryCache` and a `ManualClock`. No background tasks
//! are spawned; tests drive sweeps and syncs directly.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceExt;

use hubsync::backend::cache::MemoryCache;
use hubsync::backend::realtime::{SessionContext, SessionHandle};
use hubsync::backend::routes::create_router;
use hubsync::backend::runtime::ManualClock;
use hubsync::backend::server::AppState;
use hubsync::backend::store::{MemoryStore, RecordWrite, SharedStore};
use hubsync::shared::{AppConfig, UserId};

use super::auth_helpers::{auth_header, generate_test_token, TEST_SECRET};

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub clock: Arc<ManualClock>,
    pub store: SharedStore,
    pub cache: Arc<MemoryCache>,
    pub shutdown: watch::Sender<bool>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(mut config: AppConfig) -> Self {
        config.auth.jwt_secret = TEST_SECRET.to_string();
        let clock = Arc::new(ManualClock::at_epoch());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let (shutdown, rx) = watch::channel(false);
        let state = AppState::build(config, store.clone(), cache.clone(), clock.clone(), rx);
        let router = create_router(state.clone());
        Self {
            state,
            router,
            clock,
            store,
            cache,
            shutdown,
        }
    }

    /// Attach a hub session and the frame context its socket loop would use
    pub async fn connect(&self, user_id: UserId) -> (SessionHandle, SessionContext) {
        let handle = self
            .state
            .hub
            .attach(Some(user_id))
            .await
            .expect("attach failed");
        let ctx = SessionContext {
            session_id: handle.id,
            user_id,
            hub: self.state.hub.clone(),
            delivery: self.state.delivery.clone(),
            clock: self.state.clock.clone(),
        };
        (handle, ctx)
    }

    /// Write `value` to a record `versions` times, leaving it at that version
    pub async fn seed_record(&self, table: &str, record_id: &str, value: Value, versions: i64) {
        for v in 0..versions {
            let write = RecordWrite {
                table: table.to_string(),
                record_id: record_id.to_string(),
                expected_version: v,
                value: Some(value.clone()),
            };
            self.store
                .write_record(&write, 0, self.clock_now())
                .await
                .expect("seed write failed");
        }
    }

    pub fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        use hubsync::backend::runtime::Clock;
        self.clock.now()
    }

    /// Send one request through the router; returns status and JSON body
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user: Option<UserId>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header(header::AUTHORIZATION, auth_header(&generate_test_token(user_id)));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str, user: UserId) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(user), None).await
    }

    pub async fn post(&self, uri: &str, user: UserId, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(user), Some(body)).await
    }

    /// POST with no body
    pub async fn post_empty(&self, uri: &str, user: UserId) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(user), None).await
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}
