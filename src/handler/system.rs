use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use rbi_core::SessionManager;
use rbi_core::session::AggregateStats;

use crate::handler::ApiJsonResult;

pub fn system_router() -> Router<Arc<SessionManager>> {
    Router::new()
        .route("/", get(index))
        .route("/stats", get(stats))
}

async fn index() -> &'static str {
    "system route!"
}

async fn stats(State(rbi): State<Arc<SessionManager>>) -> ApiJsonResult<AggregateStats> {
    Ok(Json(rbi.aggregate_stats().await?))
}
