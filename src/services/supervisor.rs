//! Activation supervisor
//!
//! Periodically reconciles persisted robots against running trading workers:
//! tracks every non-deleted robot, refreshes cached plans and starts a worker
//! when an active robot enters its window.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::services::registry::{FanoutRegistry, WorkerTicket};
use crate::services::repository::RobotRepository;
use crate::services::worker::{TradingWorker, WorkerContext, WorkerExit};
use crate::sources::PriceFeed;
use crate::types::Robot;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Non-deleted robots returned by the store.
    pub fetched: usize,
    /// Robots seen for the first time.
    pub newly_tracked: usize,
    /// Workers started during this pass.
    pub spawned: usize,
    /// Robots that disappeared from the store.
    pub untracked: usize,
}

/// Keeps running workers consistent with the persisted robots.
pub struct Supervisor {
    ctx: WorkerContext,
    config: SchedulerConfig,
    workers: Mutex<Vec<JoinHandle<WorkerExit>>>,
    /// Held for a whole pass so no pass applies a fetch a later pass has overtaken.
    pass: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(
        repository: Arc<dyn RobotRepository>,
        feed: Arc<dyn PriceFeed>,
        registry: Arc<FanoutRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx: WorkerContext {
                repository,
                feed,
                registry,
                window_guard: config.window_guard,
            },
            config,
            workers: Mutex::new(Vec::new()),
            pass: Mutex::new(()),
            shutdown_tx,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<FanoutRegistry> {
        &self.ctx.registry
    }

    /// Reconcile on a fixed interval until shutdown.
    ///
    /// A failed fetch from the store ends the loop with the error: without
    /// ground truth the supervisor cannot tell which robots should trade.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Supervisor started, reconciling every {:?}",
            self.config.reconcile_interval
        );

        while !self.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Supervisor received shutdown signal");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile() {
                        error!("Failed to fetch robots, supervisor stopping: {}", e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// One reconciliation pass against the current clock.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now())
    }

    /// One reconciliation pass evaluated at `now`.
    ///
    /// Passes are serialized: the fetch and the registry updates happen under
    /// one lock, so overlapping callers apply their fetches in order.
    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let _pass = self
            .pass
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let robots = self.ctx.repository.get_all_non_deleted()?;
        let registry = &self.ctx.registry;

        let mut report = ReconcileReport {
            fetched: robots.len(),
            ..Default::default()
        };
        let mut seen = HashSet::with_capacity(robots.len());

        for robot in robots {
            if robot.is_deleted() {
                continue;
            }
            seen.insert(robot.id);

            if registry.track(&robot) {
                report.newly_tracked += 1;
            }

            let in_window = robot.window().contains(now, self.config.window_guard);
            registry.set_activated(robot.id, robot.is_active && in_window);

            if !(robot.is_active && in_window) || self.stopping.load(Ordering::SeqCst) {
                continue;
            }

            if let Some(ticket) = registry.claim_worker(robot.id) {
                self.spawn_worker(robot, ticket);
                report.spawned += 1;
            }
        }

        report.untracked = registry.retain_tracked(&seen).len();

        self.reap_finished();
        debug!("Reconciled robots: {:?}", report);
        Ok(report)
    }

    fn spawn_worker(&self, robot: Robot, ticket: WorkerTicket) {
        info!(
            "Starting worker for robot {} on {} (buy {} / sell {})",
            robot.id, robot.ticker, robot.buy_price, robot.sell_price
        );
        let worker = TradingWorker::new(robot, self.ctx.clone(), ticket);
        let handle = tokio::spawn(worker.run());
        self.lock_workers().push(handle);
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<WorkerExit>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reap_finished(&self) {
        self.lock_workers().retain(|handle| !handle.is_finished());
    }

    /// Signal the loop and every worker to stop, then wait up to the grace
    /// period for the workers to finish.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.ctx.registry.stop_all_workers();

        let handles = std::mem::take(&mut *self.lock_workers());
        let pending = handles.len();
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Worker task ended abnormally: {}", e);
                }
            }
        };

        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Timed out waiting for {} workers to stop", pending);
        } else {
            info!("All {} workers stopped", pending);
        }
    }
}
