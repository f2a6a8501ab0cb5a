use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use rbi_core::SessionManager;
use rbi_core::session::{SessionOptions, SessionSnapshot, SessionStats};
use serde::{Deserialize, Serialize};

use crate::handler::ApiJsonResult;

pub fn session_router() -> Router<Arc<SessionManager>> {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route("/{id}", get(get_session).delete(close_session))
        .route("/{id}/refresh", post(refresh_session))
        .route("/{id}/navigate", post(navigate_session))
        .route("/{id}/stats", get(get_session_stats))
}

#[derive(Serialize, Deserialize)]
struct NavigateRequest {
    url: String,
}

async fn create_session(
    State(rbi): State<Arc<SessionManager>>,
    options: Option<Json<SessionOptions>>,
) -> ApiJsonResult<SessionSnapshot> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    Ok(Json(rbi.create_session(options).await?))
}

async fn list_sessions(State(rbi): State<Arc<SessionManager>>) -> Json<Vec<SessionSnapshot>> {
    Json(rbi.list_sessions())
}

async fn get_session(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<SessionSnapshot> {
    Ok(Json(rbi.get_session(&id)?))
}

async fn close_session(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<SessionStats> {
    Ok(Json(rbi.close_session(&id).await?))
}

async fn refresh_session(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<SessionSnapshot> {
    Ok(Json(rbi.refresh_session(&id)?))
}

async fn navigate_session(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
    Json(request): Json<NavigateRequest>,
) -> ApiJsonResult<SessionSnapshot> {
    Ok(Json(rbi.navigate_session(&id, &request.url).await?))
}

async fn get_session_stats(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<SessionStats> {
    Ok(Json(rbi.get_session_stats(&id)?))
}
