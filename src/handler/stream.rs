use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::{get, post},
};
use bytes::{BufMut, Bytes, BytesMut};
use rbi_core::SessionManager;
use rbi_core::pipeline::StreamStats;
use rbi_core::transport::{ViewerFrame, ViewerSubscription};
use rbi_core::types::{QualityTuple, StreamOptions};
use serde::Deserialize;

use crate::handler::{ApiJsonResult, ApiResult};

/// sequence (u64 BE) + key flag (u8) + timestamp ms (u64 BE)
pub const FRAME_HEADER_LEN: usize = 17;

pub fn stream_router() -> Router<Arc<SessionManager>> {
    Router::new()
        .route("/{id}/stream", post(create_stream).delete(close_stream))
        .route("/{id}/stream/options", post(update_stream_options))
        .route("/{id}/stream/stats", get(get_stream_stats))
        .route("/{id}/stream/ws", get(viewer_ws))
}

/// Network figures a viewer reports back as a text message.
#[derive(Debug, Default, Deserialize)]
struct ViewerReport {
    rtt_ms: Option<f64>,
    jitter_ms: Option<f64>,
}

async fn create_stream(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
    options: Option<Json<StreamOptions>>,
) -> ApiJsonResult<StreamStats> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    Ok(Json(rbi.create_stream(&id, options).await?))
}

async fn close_stream(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<Option<StreamStats>> {
    Ok(Json(rbi.close_stream(&id).await?))
}

async fn update_stream_options(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
    Json(options): Json<StreamOptions>,
) -> ApiJsonResult<QualityTuple> {
    Ok(Json(rbi.update_stream_options(&id, options).await?))
}

async fn get_stream_stats(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> ApiJsonResult<StreamStats> {
    Ok(Json(rbi.get_stream_stats(&id)?))
}

async fn viewer_ws(
    State(rbi): State<Arc<SessionManager>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let subscription = rbi.subscribe(&id)?;
    log::info!("viewer attached to session {} on channel {}", id, subscription.channel_id());
    Ok(ws.on_upgrade(move |socket| handle_viewer(socket, id, subscription)))
}

async fn handle_viewer(mut socket: WebSocket, session_id: String, mut subscription: ViewerSubscription) {
    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let Some(frame) = frame else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(Message::Binary(frame_message(&frame))).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ViewerReport>(text.as_str()) {
                            Ok(report) => subscription.report(report.rtt_ms, report.jitter_ms),
                            Err(e) => log::debug!("viewer {}: bad report: {}", session_id, e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => subscription.record_received(data.len()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("viewer {}: websocket error: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }
    log::info!("viewer detached from session {}", session_id);
}

pub fn frame_message(frame: &ViewerFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.data.len());
    buf.put_u64(frame.meta.sequence);
    buf.put_u8(frame.meta.is_key as u8);
    buf.put_u64(frame.meta.timestamp_ms);
    buf.extend_from_slice(&frame.data);
    buf.freeze()
}
