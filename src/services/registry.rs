//! Shared runtime registry: tracked robots, worker slots and subscriber sets.
//!
//! Everything here sits behind one mutex so that check-then-act sequences
//! (claim a worker slot, prune a dead subscriber) never interleave with a
//! concurrent reconciliation pass or attach.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::types::{Robot, RobotId, ServerMessage};

/// Transport handle of a live subscriber.
pub trait SubscriberConnection: Send + Sync {
    /// Write one serialized snapshot. Any error means the connection is dead.
    fn send(&self, payload: &str) -> Result<()>;
}

impl SubscriberConnection for mpsc::UnboundedSender<String> {
    fn send(&self, payload: &str) -> Result<()> {
        mpsc::UnboundedSender::send(self, payload.to_string())
            .map_err(|_| AppError::Connection("subscriber channel closed".to_string()))
    }
}

/// One update handed from a worker to the robot's broadcaster.
pub struct Delivery {
    pub robot: Robot,
    accepted: oneshot::Sender<()>,
}

/// Sending half of a robot's delivery channel.
#[derive(Clone)]
pub struct DeliverySender {
    tx: mpsc::Sender<Delivery>,
}

impl DeliverySender {
    /// Hand a snapshot to the broadcaster and wait until it has been taken.
    pub async fn deliver(&self, robot: Robot) -> Result<()> {
        let (accepted, taken) = oneshot::channel();
        self.tx
            .send(Delivery { robot, accepted })
            .await
            .map_err(|_| AppError::Internal("broadcaster stopped".to_string()))?;
        taken
            .await
            .map_err(|_| AppError::Internal("broadcaster dropped delivery".to_string()))
    }
}

/// Permission to run the single worker of a robot.
#[derive(Debug)]
pub struct WorkerTicket {
    pub robot_id: RobotId,
    pub generation: u64,
    pub stop: watch::Receiver<bool>,
}

/// Read-only view of a tracked robot.
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub robot: Robot,
    /// Active and inside its window as of the last observation.
    pub activated: bool,
    pub has_worker: bool,
}

struct WorkerSlot {
    generation: u64,
    stop: watch::Sender<bool>,
}

struct RuntimeEntry {
    robot: Robot,
    activated: bool,
    worker: Option<WorkerSlot>,
    delivery: DeliverySender,
}

struct Subscriber {
    id: Uuid,
    conn: Arc<dyn SubscriberConnection>,
}

#[derive(Default)]
struct RegistryState {
    robots: HashMap<RobotId, RuntimeEntry>,
    subscribers: HashMap<RobotId, Vec<Subscriber>>,
    next_generation: u64,
}

/// Fan-out registry shared by the supervisor, the workers and the transport.
#[derive(Default)]
pub struct FanoutRegistry {
    state: Mutex<RegistryState>,
}

impl FanoutRegistry {
    /// Create a new registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-written,
        // so a poisoned guard is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========== Robot tracking ==========

    /// Track a robot or refresh its cached plan fields.
    ///
    /// The first sighting creates the robot's delivery channel and starts its
    /// broadcaster; returns `true` in that case.
    pub fn track(self: &Arc<Self>, robot: &Robot) -> bool {
        let mut state = self.lock();
        if let Some(entry) = state.robots.get_mut(&robot.id) {
            entry.robot.refresh_plan_from(robot);
            return false;
        }

        let (tx, rx) = mpsc::channel(1);
        state.robots.insert(
            robot.id,
            RuntimeEntry {
                robot: robot.clone(),
                activated: false,
                worker: None,
                delivery: DeliverySender { tx },
            },
        );
        drop(state);

        tokio::spawn(run_broadcaster(Arc::clone(self), robot.id, rx));
        debug!("Tracking robot {} ({})", robot.id, robot.ticker);
        true
    }

    /// Drop robots not in `keep`, stopping their workers. Returns the ids
    /// that were removed.
    pub fn retain_tracked(&self, keep: &HashSet<RobotId>) -> Vec<RobotId> {
        let mut state = self.lock();
        let gone: Vec<RobotId> = state
            .robots
            .keys()
            .filter(|id| !keep.contains(*id))
            .copied()
            .collect();

        for id in &gone {
            if let Some(entry) = state.robots.remove(id) {
                if let Some(slot) = entry.worker {
                    let _ = slot.stop.send(true);
                }
            }
            info!("Robot {} is no longer tracked", id);
        }
        gone
    }

    pub fn set_activated(&self, robot_id: RobotId, activated: bool) {
        if let Some(entry) = self.lock().robots.get_mut(&robot_id) {
            entry.activated = activated;
        }
    }

    pub fn snapshot(&self, robot_id: RobotId) -> Option<RuntimeSnapshot> {
        self.lock().robots.get(&robot_id).map(|entry| RuntimeSnapshot {
            robot: entry.robot.clone(),
            activated: entry.activated,
            has_worker: entry.worker.is_some(),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().robots.len()
    }

    // ========== Worker slots ==========

    /// Atomically claim the worker slot of a tracked robot.
    ///
    /// Returns `None` when the robot is unknown or already has a worker.
    pub fn claim_worker(&self, robot_id: RobotId) -> Option<WorkerTicket> {
        let mut state = self.lock();
        let generation = state.next_generation + 1;
        let entry = state.robots.get_mut(&robot_id)?;
        if entry.worker.is_some() {
            return None;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        entry.worker = Some(WorkerSlot {
            generation,
            stop: stop_tx,
        });
        state.next_generation = generation;

        Some(WorkerTicket {
            robot_id,
            generation,
            stop: stop_rx,
        })
    }

    /// Free the slot held by `generation`. A stale generation is ignored.
    pub fn release_worker(&self, robot_id: RobotId, generation: u64) -> bool {
        let mut state = self.lock();
        match state.robots.get_mut(&robot_id) {
            Some(entry)
                if entry
                    .worker
                    .as_ref()
                    .is_some_and(|slot| slot.generation == generation) =>
            {
                entry.worker = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_worker(&self, robot_id: RobotId) -> bool {
        self.lock()
            .robots
            .get(&robot_id)
            .is_some_and(|entry| entry.worker.is_some())
    }

    pub fn running_workers(&self) -> usize {
        self.lock()
            .robots
            .values()
            .filter(|entry| entry.worker.is_some())
            .count()
    }

    /// Signal every running worker to stop.
    pub fn stop_all_workers(&self) {
        let state = self.lock();
        for entry in state.robots.values() {
            if let Some(slot) = &entry.worker {
                let _ = slot.stop.send(true);
            }
        }
    }

    // ========== Subscribers ==========

    /// Register a live connection for a robot.
    pub fn attach(&self, robot_id: RobotId, conn: Arc<dyn SubscriberConnection>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock()
            .subscribers
            .entry(robot_id)
            .or_default()
            .push(Subscriber { id, conn });
        debug!("Subscriber {} attached to robot {}", id, robot_id);
        id
    }

    /// Remove a connection. Returns whether it was registered.
    pub fn detach(&self, robot_id: RobotId, subscriber_id: Uuid) -> bool {
        let removed = remove_subscribers(&mut self.lock(), robot_id, &[subscriber_id]) > 0;
        if removed {
            debug!("Subscriber {} detached from robot {}", subscriber_id, robot_id);
        }
        removed
    }

    pub fn subscriber_count(&self, robot_id: RobotId) -> usize {
        self.lock()
            .subscribers
            .get(&robot_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.lock().subscribers.values().map(|subs| subs.len()).sum()
    }

    /// Delivery channel of a tracked robot.
    pub fn delivery(&self, robot_id: RobotId) -> Option<DeliverySender> {
        self.lock()
            .robots
            .get(&robot_id)
            .map(|entry| entry.delivery.clone())
    }

    /// Write `payload` to every subscriber of a robot in attach order.
    ///
    /// Connections that fail are removed; the rest still receive the
    /// payload. Returns the number of successful writes.
    pub fn broadcast(&self, robot_id: RobotId, payload: &str) -> usize {
        let targets: Vec<(Uuid, Arc<dyn SubscriberConnection>)> = match self
            .lock()
            .subscribers
            .get(&robot_id)
        {
            Some(subs) => subs.iter().map(|s| (s.id, Arc::clone(&s.conn))).collect(),
            None => return 0,
        };

        let mut dead = Vec::new();
        for (id, conn) in &targets {
            if let Err(e) = conn.send(payload) {
                debug!("Dropping subscriber {} of robot {}: {}", id, robot_id, e);
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            remove_subscribers(&mut self.lock(), robot_id, &dead);
        }
        targets.len() - dead.len()
    }
}

fn remove_subscribers(state: &mut RegistryState, robot_id: RobotId, ids: &[Uuid]) -> usize {
    let Some(subs) = state.subscribers.get_mut(&robot_id) else {
        return 0;
    };
    let before = subs.len();
    subs.retain(|s| !ids.contains(&s.id));
    let removed = before - subs.len();
    if subs.is_empty() {
        state.subscribers.remove(&robot_id);
    }
    removed
}

/// Serialize each delivered snapshot and fan it out. Ends once the robot is
/// untracked and every worker-held sender is gone.
async fn run_broadcaster(
    registry: Arc<FanoutRegistry>,
    robot_id: RobotId,
    mut rx: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        let _ = delivery.accepted.send(());

        let msg = ServerMessage::RobotUpdate {
            data: delivery.robot,
        };
        match serde_json::to_string(&msg) {
            Ok(json) => {
                let sent = registry.broadcast(robot_id, &json);
                debug!("Robot {} update sent to {} subscribers", robot_id, sent);
            }
            Err(e) => error!("Failed to serialize robot {} update: {}", robot_id, e),
        }
    }
    warn!("Broadcaster for robot {} stopped", robot_id);
}
