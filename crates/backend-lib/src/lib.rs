// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Livestream session and signaling backend.
//!
//! The pieces, leaf-first: a persistent session store, a process-local
//! room registry of live connections, the WebRTC signaling relay, the
//! presence/chat broadcaster, and the lifecycle controller that owns
//! every session state transition. [`AppState`] wires them together for
//! the HTTP and WebSocket routers.
//!
//! The registry is process-local by design: all connections for a given
//! stream must be routed to one instance.

pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod rate_limit;
pub mod registry;
pub mod reaper;
pub mod room;
pub mod signaling;
pub mod store;
pub mod validation;
pub mod ws_router;

use crate::auth::IdentityProvider;
use crate::broadcaster::Broadcaster;
use crate::config::Settings;
use crate::enrollment::EnrollmentProvider;
use crate::lifecycle::LifecycleController;
use crate::reaper::Reaper;
use crate::registry::RoomRegistry;
use crate::signaling::SignalingRelay;
use crate::store::SessionStore;
use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state handed to every router.
pub struct AppState {
    pub settings: Settings,
    pub identity: Arc<dyn IdentityProvider>,
    pub lifecycle: Arc<LifecycleController>,
    pub registry: Arc<RoomRegistry>,
    pub relay: SignalingRelay,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentityProvider>,
        enrollment: Arc<dyn EnrollmentProvider>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleController::new(
            store,
            enrollment,
            &settings.rate_limit,
            &settings.ice,
            settings.default_max_participants,
            settings.op_timeout(),
        ));
        let registry = Arc::new(RoomRegistry::new());

        Self {
            relay: SignalingRelay::new(lifecycle.clone(), registry.clone(), settings.op_timeout()),
            broadcaster: Broadcaster::new(lifecycle.clone(), registry.clone()),
            lifecycle,
            registry,
            identity,
            settings,
        }
    }

    /// Start the idle-connection reaper for this state.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        Reaper::new(
            self.lifecycle.clone(),
            self.registry.clone(),
            self.settings.sweep_interval(),
            self.settings.liveness_timeout(),
        )
        .spawn()
    }
}

/// Build the full application router: REST surface plus the room
/// WebSocket, with tracing and permissive CORS.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(handlers::sessions::create_router(state.clone()))
        .merge(ws_router::create_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
