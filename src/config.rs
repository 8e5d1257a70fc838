use std::env;
use std::time::Duration;

/// Supervisor and worker timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between two reconciliation passes.
    pub reconcile_interval: Duration,
    /// Offset added to the local clock before comparing against plan windows.
    /// Plan windows are stored without a zone, so the scheduler compensates
    /// for the skew between its clock and the persisted window.
    pub window_guard: chrono::Duration,
    /// How long shutdown waits for workers to drain.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(3),
            window_guard: chrono::Duration::hours(3),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database path for robot definitions and statistics.
    pub database_path: String,
    /// WebSocket URL of the upstream price feed.
    pub price_feed_url: String,
    /// Interval between robot list snapshots on the polling sockets.
    pub snapshot_interval: Duration,
    /// Scheduler timing.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = SchedulerConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "robots.db".to_string()),
            price_feed_url: env::var("PRICE_FEED_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:5000/prices".to_string()),
            snapshot_interval: env::var("SNAPSHOT_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1)),
            scheduler: SchedulerConfig {
                reconcile_interval: env::var("RECONCILE_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.reconcile_interval),
                window_guard: env::var("WINDOW_GUARD_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(chrono::Duration::seconds)
                    .unwrap_or(defaults.window_guard),
                shutdown_grace: env::var("SHUTDOWN_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.shutdown_grace),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
