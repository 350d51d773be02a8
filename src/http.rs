use std::sync::Arc;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use log::info;

use crate::connection::WsConnection;
use crate::server_inner::{ServerInner, SessionId};

pub fn router(server: Arc<ServerInner>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(close_session))
        .with_state(server)
}

async fn upgrade(State(server): State<Arc<ServerInner>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        info!("streamer connected");
        server.serve_connection(WsConnection::new(socket)).await;
    })
}

async fn list_sessions(State(server): State<Arc<ServerInner>>) -> impl IntoResponse {
    Json(server.list().await)
}

async fn close_session(
    State(server): State<Arc<ServerInner>>,
    Path(id): Path<SessionId>,
) -> StatusCode {
    if server.close_session(id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
