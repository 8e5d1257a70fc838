//! Robotrader - paper-trading robots with live subscriber fan-out
//!
//! A [`Supervisor`](services::Supervisor) reconciles persisted robots against
//! running [`TradingWorker`](services::TradingWorker)s; each worker trades one
//! robot against a live price feed and publishes its deals through the
//! [`FanoutRegistry`](services::FanoutRegistry).

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use std::sync::Arc;

use config::Config;
use services::{FanoutRegistry, RobotRepository};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<dyn RobotRepository>,
    pub registry: Arc<FanoutRegistry>,
}

// Re-export commonly used types
pub use error::{AppError, Result};
pub use types::*;
