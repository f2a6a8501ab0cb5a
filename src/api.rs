use std::sync::Arc;

use axum::Router;
use rbi_core::SessionManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) fn app(rbi: Arc<SessionManager>) -> Router {
    Router::new()
        .nest(
            "/session",
            crate::handler::session::session_router().merge(crate::handler::stream::stream_router()),
        )
        .nest("/system", crate::handler::system::system_router())
        .with_state(rbi)
}

pub(crate) fn start_api_server(listen: String, rbi: Arc<SessionManager>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = app(rbi);

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Error binding API server to {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Shutting down API server...");
        }
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;
