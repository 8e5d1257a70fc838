//! Shared test doubles for the integration tests.
#![allow(dead_code)]

use chrono::{Duration, Utc};
use futures_util::stream;
use futures_util::StreamExt;
use robotrader::config::SchedulerConfig;
use robotrader::services::{RobotRepository, RobotStore, SubscriberConnection};
use robotrader::sources::{PriceFeed, TickStream};
use robotrader::{AppError, Result, Robot, RobotDraft, RobotId, Tick, UserId};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Clock skew compensation used by every test scheduler.
///
/// Windows are placed in the future relative to the real clock, so the store
/// accepts activation, while the guard moves them "now" for the scheduler.
pub fn guard() -> Duration {
    Duration::hours(2)
}

pub fn scheduler() -> SchedulerConfig {
    SchedulerConfig {
        reconcile_interval: std::time::Duration::from_millis(20),
        window_guard: guard(),
        shutdown_grace: std::time::Duration::from_secs(1),
    }
}

/// A draft whose window contains the guarded clock for the next hour.
pub fn live_draft(ticker: &str, buy: f64, sell: f64) -> RobotDraft {
    let now = Utc::now();
    RobotDraft {
        ticker: ticker.to_string(),
        buy_price: buy,
        sell_price: sell,
        plan_start: now + Duration::hours(1),
        plan_end: now + Duration::hours(3),
        plan_yield: 10.0,
    }
}

/// A draft whose window closed before the guarded clock.
pub fn expired_draft(ticker: &str) -> RobotDraft {
    let now = Utc::now();
    RobotDraft {
        ticker: ticker.to_string(),
        buy_price: 100.0,
        sell_price: 110.0,
        plan_start: now - Duration::hours(3),
        plan_end: now - Duration::hours(1),
        plan_yield: 10.0,
    }
}

/// Create and activate a robot.
pub fn active_robot(repo: &dyn RobotRepository, owner: UserId, draft: &RobotDraft) -> Robot {
    let robot = repo.create(owner, draft).unwrap();
    assert!(repo.activate(robot.id).unwrap());
    repo.get_robot(robot.id).unwrap()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cond()
}

// =============================================================================
// Price feed
// =============================================================================

#[derive(Debug, Clone)]
pub enum Step {
    Tick(f64, f64),
    Fail(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tail {
    /// Stream ends after the script.
    End,
    /// Stream stays open without further ticks.
    Hang,
}

/// Feed replaying one scripted session per `open_stream` call. Once the
/// sessions are used up, streams hang.
#[derive(Default)]
pub struct ScriptedFeed {
    sessions: Mutex<VecDeque<(Vec<Step>, Tail)>>,
    opens: AtomicUsize,
    fail_open: AtomicBool,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, steps: Vec<Step>, tail: Tail) {
        self.sessions.lock().unwrap().push_back((steps, tail));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

impl PriceFeed for ScriptedFeed {
    fn open_stream<'a>(
        &'a self,
        _ticker: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TickStream>> + Send + 'a>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(AppError::Feed("connection refused".to_string()));
            }

            let (steps, tail) = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Vec::new(), Tail::Hang));

            let items: Vec<Result<Tick>> = steps
                .into_iter()
                .map(|step| match step {
                    Step::Tick(buy, sell) => Ok(Tick::new(buy, sell)),
                    Step::Fail(msg) => Err(AppError::Feed(msg.to_string())),
                })
                .collect();

            let head = stream::iter(items);
            let stream: TickStream = match tail {
                Tail::End => Box::pin(head),
                Tail::Hang => Box::pin(head.chain(stream::pending())),
            };
            Ok(stream)
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// In-memory store with fault injection.
pub struct FlakyRepository {
    pub inner: RobotStore,
    fail_fetch: AtomicBool,
    /// 1-based persist call that fails; 0 disables.
    fail_persist_on_call: AtomicUsize,
    persist_calls: AtomicUsize,
    /// Signals once the next fetch has read the store, then waits for release.
    park: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self {
            inner: RobotStore::new_in_memory().unwrap(),
            fail_fetch: AtomicBool::new(false),
            fail_persist_on_call: AtomicUsize::new(0),
            persist_calls: AtomicUsize::new(0),
            park: Mutex::new(None),
        }
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_persist_on_call(&self, call: usize) {
        self.fail_persist_on_call.store(call, Ordering::SeqCst);
    }

    /// Park the next `get_all_non_deleted` right after it reads the store.
    /// Returns a receiver that fires once the read happened and a sender
    /// that lets the fetch return.
    pub fn park_next_fetch(&self) -> (Receiver<()>, Sender<()>) {
        let (fetched_tx, fetched_rx) = channel();
        let (release_tx, release_rx) = channel();
        *self.park.lock().unwrap() = Some((fetched_tx, release_rx));
        (fetched_rx, release_tx)
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

impl RobotRepository for FlakyRepository {
    fn create(&self, owner: UserId, draft: &RobotDraft) -> Result<Robot> {
        self.inner.create(owner, draft)
    }

    fn delete(&self, id: RobotId) -> Result<()> {
        self.inner.delete(id)
    }

    fn get_robot(&self, id: RobotId) -> Result<Robot> {
        self.inner.get_robot(id)
    }

    fn get_all_user_robots(&self, owner: UserId) -> Result<Vec<Robot>> {
        self.inner.get_all_user_robots(owner)
    }

    fn get_all_ticker_robots(&self, ticker: &str) -> Result<Vec<Robot>> {
        self.inner.get_all_ticker_robots(ticker)
    }

    fn get_all_non_deleted(&self) -> Result<Vec<Robot>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(AppError::Internal("database unavailable".to_string()));
        }
        let robots = self.inner.get_all_non_deleted()?;
        let park = self.park.lock().unwrap().take();
        if let Some((fetched, release)) = park {
            let _ = fetched.send(());
            let _ = release.recv();
        }
        Ok(robots)
    }

    fn activate(&self, id: RobotId) -> Result<bool> {
        self.inner.activate(id)
    }

    fn deactivate(&self, id: RobotId) -> Result<bool> {
        self.inner.deactivate(id)
    }

    fn update(&self, robot: &Robot) -> Result<bool> {
        self.inner.update(robot)
    }

    fn favorite(&self, source: &Robot, owner: UserId) -> Result<Robot> {
        self.inner.favorite(source, owner)
    }

    fn persist_trade_result(&self, id: RobotId, fact_yield: f64, deals_count: i64) -> Result<()> {
        let call = self.persist_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_persist_on_call.load(Ordering::SeqCst) {
            return Err(AppError::Internal("write failed".to_string()));
        }
        self.inner.persist_trade_result(id, fact_yield, deals_count)
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Connection that records every payload, or fails every write.
#[derive(Default)]
pub struct RecordingConnection {
    received: Mutex<Vec<String>>,
    broken: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broken() -> Self {
        let conn = Self::default();
        conn.broken.store(true, Ordering::SeqCst);
        conn
    }

    pub fn break_now(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl SubscriberConnection for RecordingConnection {
    fn send(&self, payload: &str) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AppError::Connection("peer went away".to_string()));
        }
        self.received.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}
