//! Trading worker: runs one robot's buy-low/sell-high loop against a live
//! tick stream, persisting and publishing every completed deal.

use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::services::registry::{FanoutRegistry, WorkerTicket};
use crate::services::repository::RobotRepository;
use crate::sources::PriceFeed;
use crate::types::{ActivationWindow, Robot, Tick};

/// Phase of the trade state machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TradePhase {
    AwaitingBuy,
    AwaitingSell { buy_fill: f64 },
}

/// A completed buy/sell round trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub buy_fill: f64,
    pub sell_fill: f64,
}

impl Deal {
    pub fn profit(&self) -> f64 {
        self.sell_fill - self.buy_fill
    }
}

/// Buy when the quote drops to the robot's buy price, sell when it rises to
/// the robot's sell price.
#[derive(Debug, Clone)]
pub struct TradeMachine {
    buy_price: f64,
    sell_price: f64,
    phase: TradePhase,
}

impl TradeMachine {
    pub fn new(buy_price: f64, sell_price: f64) -> Self {
        Self {
            buy_price,
            sell_price,
            phase: TradePhase::AwaitingBuy,
        }
    }

    pub fn phase(&self) -> TradePhase {
        self.phase
    }

    /// Feed one tick. A buy fill is checked against the sell leg of the same
    /// tick, so one quote can complete a whole deal.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Deal> {
        if let TradePhase::AwaitingBuy = self.phase {
            if self.buy_price >= tick.buy_price {
                self.phase = TradePhase::AwaitingSell {
                    buy_fill: tick.buy_price,
                };
            } else {
                return None;
            }
        }

        match self.phase {
            TradePhase::AwaitingSell { buy_fill } if self.sell_price <= tick.sell_price => {
                self.phase = TradePhase::AwaitingBuy;
                Some(Deal {
                    buy_fill,
                    sell_fill: tick.sell_price,
                })
            }
            _ => None,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// The clock left the activation window.
    WindowClosed,
    /// The feed ended the stream.
    FeedEnded,
    /// Stop was signalled (shutdown or robot removal).
    Stopped,
    /// Feed or persistence failure.
    Failed(AppError),
}

enum Wake {
    Stop { closed: bool },
    WindowTimer,
    Tick(Option<Result<Tick, AppError>>),
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub repository: Arc<dyn RobotRepository>,
    pub feed: Arc<dyn PriceFeed>,
    pub registry: Arc<FanoutRegistry>,
    pub window_guard: chrono::Duration,
}

/// Runtime state of one active robot.
///
/// Trading parameters and window are fixed when the worker is created; edits
/// to an active robot are rejected by the store.
pub struct TradingWorker {
    robot: Robot,
    window: ActivationWindow,
    machine: TradeMachine,
    ctx: WorkerContext,
    ticket: WorkerTicket,
}

impl TradingWorker {
    pub fn new(robot: Robot, ctx: WorkerContext, ticket: WorkerTicket) -> Self {
        let window = robot.window();
        let machine = TradeMachine::new(robot.buy_price, robot.sell_price);
        Self {
            robot,
            window,
            machine,
            ctx,
            ticket,
        }
    }

    fn in_window(&self) -> bool {
        self.window.contains(Utc::now(), self.ctx.window_guard)
    }

    /// Run until the window closes, the feed ends, a stop is signalled or a
    /// failure occurs. Always releases the worker slot.
    pub async fn run(mut self) -> WorkerExit {
        let exit = self.trade().await;
        let robot_id = self.robot.id;

        match &exit {
            WorkerExit::WindowClosed => {
                self.ctx.registry.set_activated(robot_id, false);
                info!("Robot {} left its window, worker done", robot_id);
            }
            WorkerExit::FeedEnded => info!("Price feed for robot {} ended", robot_id),
            WorkerExit::Stopped => info!("Worker for robot {} stopped", robot_id),
            WorkerExit::Failed(e) => error!("Worker for robot {} failed: {}", robot_id, e),
        }

        self.ctx
            .registry
            .release_worker(robot_id, self.ticket.generation);
        exit
    }

    async fn trade(&mut self) -> WorkerExit {
        let mut stream = match self.ctx.feed.open_stream(&self.robot.ticker).await {
            Ok(stream) => stream,
            Err(e) => return WorkerExit::Failed(e),
        };
        debug!(
            "Stream started for robot {} on {}",
            self.robot.id, self.robot.ticker
        );

        loop {
            if !self.in_window() {
                return WorkerExit::WindowClosed;
            }
            if *self.ticket.stop.borrow() {
                return WorkerExit::Stopped;
            }

            let closes_in = (self.window.closes_at(self.ctx.window_guard) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            let wake = tokio::select! {
                biased;
                changed = self.ticket.stop.changed() => Wake::Stop { closed: changed.is_err() },
                _ = tokio::time::sleep(closes_in) => Wake::WindowTimer,
                next = stream.next() => Wake::Tick(next),
            };

            let tick = match wake {
                Wake::Stop { closed } => {
                    if closed || *self.ticket.stop.borrow() {
                        return WorkerExit::Stopped;
                    }
                    continue;
                }
                Wake::WindowTimer => continue,
                Wake::Tick(Some(Ok(tick))) => tick,
                Wake::Tick(Some(Err(e))) => return WorkerExit::Failed(e),
                Wake::Tick(None) => return WorkerExit::FeedEnded,
            };

            if !self.in_window() {
                return WorkerExit::WindowClosed;
            }

            if let Some(deal) = self.machine.on_tick(&tick) {
                if let Err(e) = self.settle(deal).await {
                    return WorkerExit::Failed(e);
                }
            }
        }
    }

    /// Apply a deal, persist it and, when anyone listens, publish it.
    async fn settle(&mut self, deal: Deal) -> Result<(), AppError> {
        self.robot.deals_count += 1;
        self.robot.fact_yield += deal.profit();
        debug!(
            "Robot {} deal #{}: bought {} sold {} (yield {})",
            self.robot.id,
            self.robot.deals_count,
            deal.buy_fill,
            deal.sell_fill,
            self.robot.fact_yield
        );

        self.ctx.repository.persist_trade_result(
            self.robot.id,
            self.robot.fact_yield,
            self.robot.deals_count,
        )?;

        if self.ctx.registry.subscriber_count(self.robot.id) == 0 {
            return Ok(());
        }
        match self.ctx.registry.delivery(self.robot.id) {
            Some(delivery) => {
                if let Err(e) = delivery.deliver(self.robot.clone()).await {
                    warn!("Robot {} update not delivered: {}", self.robot.id, e);
                }
            }
            None => warn!("Robot {} has subscribers but is not tracked", self.robot.id),
        }
        Ok(())
    }
}
