//! Axum router and shared process state (§6).
//!
//! `AppState` is the one value every handler closes over — the store, the queue
//! adapter, the event bus, and the forge client, each already an owned/`Arc`-wrapped
//! handle so cloning the struct per request is cheap, mirroring the teacher's
//! `Arc<AppState>`-via-`State` extractor convention.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use conductor_common::{ProjectId, RunId};

use crate::actions::{self, ActionRequest};
use crate::config::Config;
use crate::errors::ConductorError;
use crate::events::EventBus;
use crate::forge::ForgeClient;
use crate::oauth::{self, hash_session_token, SESSION_COOKIE_NAME};
use crate::queue::QueueAdapter;
use crate::sse;
use crate::store::StoreHandle;
use crate::store::models::User;
use crate::webhook;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: StoreHandle,
    pub queue: Arc<dyn QueueAdapter>,
    pub events: EventBus,
    pub forge: Arc<dyn ForgeClient>,
}

/// An authenticated caller, resolved from the session cookie (§4.13). Any route that
/// takes this as an argument is implicitly cookie-gated — a missing, unknown, or
/// expired session rejects with `ConductorError::AuthenticationRequired` before the
/// handler body runs.
pub struct SessionUser {
    pub user: User,
}

impl FromRequestParts<AppState> for SessionUser {
    type Rejection = ConductorError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .ok_or(ConductorError::AuthenticationRequired)?;
        let token_hash = hash_session_token(&token);

        let session = state
            .store
            .call(move |db| db.find_session_by_token_hash(&token_hash))
            .await
            .map_err(ConductorError::Internal)?
            .ok_or(ConductorError::AuthenticationRequired)?;
        if session.expires_at < chrono::Utc::now() {
            return Err(ConductorError::AuthenticationRequired);
        }

        let user = state
            .store
            .call(move |db| db.get_user(&session.user_id))
            .await
            .map_err(ConductorError::Internal)?
            .ok_or(ConductorError::AuthenticationRequired)?;
        Ok(SessionUser { user })
    }
}

/// Confirms `run_id` belongs to a project the caller owns, collapsing a mismatch into
/// `NotFound` so a run's existence is never leaked to a user who cannot see it (§7).
async fn authorize_run_access(store: &StoreHandle, user_id: &conductor_common::UserId, run_id: &RunId) -> Result<(), ConductorError> {
    let run = store
        .call({
            let run_id = run_id.clone();
            move |db| db.get_run(&run_id)
        })
        .await
        .map_err(ConductorError::Internal)?
        .ok_or_else(|| ConductorError::not_found(format!("run {run_id}")))?;

    let owned_projects: Vec<ProjectId> = store
        .call({
            let user_id = user_id.clone();
            move |db| db.list_projects_for_user(&user_id)
        })
        .await
        .map_err(ConductorError::Internal)?
        .into_iter()
        .map(|p| p.id)
        .collect();

    if owned_projects.contains(&run.project_id) {
        Ok(())
    } else {
        Err(ConductorError::not_found(format!("run {run_id}")))
    }
}

async fn handle_action(
    State(state): State<AppState>,
    session_user: SessionUser,
    Path(run_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Result<impl IntoResponse, ConductorError> {
    let run_id = RunId::from(run_id);
    authorize_run_access(&state.store, &session_user.user.id, &run_id).await?;

    let run = actions::dispatch(
        &state.store,
        state.queue.as_ref(),
        &state.events,
        &run_id,
        session_user.user.id.as_str(),
        req,
    )
    .await?;

    Ok(Json(json!({"run": run})))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let queue_health = state.queue.health_check().await;
    Json(json!({"ok": queue_health.healthy, "queueLatencyMs": queue_health.latency_ms}))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/{forge}", post(webhook::handle_webhook))
        .route("/runs/{run_id}/actions", post(handle_action))
        .route("/events/stream", get(sse::stream_handler))
        .route("/auth/login", get(oauth::login))
        .route("/auth/callback", get(oauth::login_callback))
        .route("/auth/installation/callback", get(oauth::installation_callback))
        .route("/auth/logout", post(oauth::logout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
