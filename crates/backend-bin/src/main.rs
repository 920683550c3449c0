// ============================
// crates/backend-bin/src/main.rs
// ============================
//! Server binary: wires the flat-file store, the in-process token and
//! enrollment providers, and the routers into one listener. A dev-only
//! token endpoint is mounted here so clients can obtain credentials
//! without an external identity service.

use anyhow::Context;
use axum::{extract::State, routing::post, Json, Router};
use clap::Parser;
use livecast_backend_lib::{
    auth::{Identity, TokenRegistry},
    config::Settings,
    create_app,
    enrollment::MemoryEnrollments,
    store::FlatFileStore,
    AppState,
};
use livecast_common::ParticipantRole;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "livecast-server", about = "Livestream session and signaling server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Override the bind address from the config
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Deserialize)]
struct TokenRequest {
    display_name: String,
    role: ParticipantRole,
    user_id: Option<Uuid>,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    user_id: Uuid,
}

async fn issue_token(
    State(tokens): State<TokenRegistry>,
    Json(req): Json<TokenRequest>,
) -> Json<TokenResponse> {
    let user_id = req.user_id.unwrap_or_else(Uuid::new_v4);
    let token = tokens.issue(Identity {
        user_id,
        display_name: req.display_name,
        role: req.role,
    });
    Json(TokenResponse { token, user_id })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config).context("loading configuration")?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let store = Arc::new(FlatFileStore::new(&settings.data_dir).context("opening data dir")?);
    let tokens = TokenRegistry::default();
    let enrollments = Arc::new(MemoryEnrollments::new());

    let bind_addr = settings.bind_addr;
    let state = Arc::new(AppState::new(
        settings,
        store,
        Arc::new(tokens.clone()),
        enrollments,
    ));
    state.spawn_reaper();

    let app = Router::new()
        .route("/api/auth/token", post(issue_token))
        .with_state(tokens)
        .merge(create_app(state));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
