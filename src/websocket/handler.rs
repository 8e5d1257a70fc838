use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::services::RobotFilter;
use crate::types::{RobotId, ServerMessage, UserId};
use crate::AppState;

/// WebSocket routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/robots", get(robots_ws_handler))
        .route("/ws/robots/:id", get(robot_ws_handler))
        .route("/ws/users/:id/robots", get(user_robots_ws_handler))
}

/// Live deal updates for a single robot.
pub async fn robot_ws_handler(
    ws: WebSocketUpgrade,
    Path(robot_id): Path<RobotId>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_robot_socket(socket, robot_id, state))
}

/// Periodic snapshots of every non-deleted robot.
pub async fn robots_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_snapshot_socket(socket, RobotFilter::All, state))
}

/// Periodic snapshots of one owner's robots.
pub async fn user_robots_ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<UserId>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_snapshot_socket(socket, RobotFilter::Owner(user_id), state))
}

async fn handle_robot_socket(socket: WebSocket, robot_id: RobotId, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel feeding this socket; the registry writes into it on broadcast.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriber_id = state.registry.attach(robot_id, Arc::new(tx));
    info!("Subscriber {} connected to robot {}", subscriber_id, robot_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!("Ignoring message from subscriber {}: {}", subscriber_id, text);
            }
            Err(e) => {
                error!("WebSocket error for subscriber {}: {}", subscriber_id, e);
                break;
            }
            _ => {}
        }
    }

    state.registry.detach(robot_id, subscriber_id);
    send_task.abort();
    info!("Subscriber {} left robot {}", subscriber_id, robot_id);
}

async fn handle_snapshot_socket(mut socket: WebSocket, filter: RobotFilter, state: AppState) {
    let mut ticker = tokio::time::interval(state.config.snapshot_interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let msg = match state.repository.filter(&filter) {
            Ok(robots) => ServerMessage::Robots { data: robots },
            Err(e) => {
                error!("Failed to load robots for {:?}: {}", filter, e);
                ServerMessage::Error {
                    error: "failed to get robots".to_string(),
                }
            }
        };
        let failed = matches!(msg, ServerMessage::Error { .. });

        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!("Can't serialize robots snapshot: {}", e);
                continue;
            }
        };

        if let Err(e) = socket.send(Message::Text(json)).await {
            debug!("Snapshot socket closed: {}", e);
            break;
        }
        if failed {
            break;
        }
    }
}
