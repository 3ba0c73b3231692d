use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::fleet::FleetController;
use crate::notifications::NotificationHandler;
use crate::project::ProjectDirectory;

pub struct AppState {
    pub projects: ProjectDirectory,
    pub fleet: Arc<FleetController>,
    pub notifications: NotificationHandler,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(project_index))
        .route("/health", get(health))
        .route("/update", post(update))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn project_index(State(state): State<Arc<AppState>>) -> Response {
    match state.projects.ids() {
        Ok(ids) => Json(ids).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "cannot list projects");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn update(State(state): State<Arc<AppState>>, body: String) -> Response {
    match state
        .notifications
        .handle(&body, &state.projects, &state.fleet)
        .await
    {
        Ok(outcome) => outcome.reply().into_response(),
        Err(e) => {
            tracing::error!(error = %e, "notification handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
