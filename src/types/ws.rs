use super::Robot;
use serde::{Deserialize, Serialize};

/// Outgoing WebSocket message to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Fresh statistics after a completed deal.
    RobotUpdate { data: Robot },
    /// Periodic snapshot of a robot list.
    Robots { data: Vec<Robot> },
    /// Error message.
    Error { error: String },
}

/// Message sent by the price feed subscriber to the upstream source.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRequest {
    Subscribe { ticker: String },
}
