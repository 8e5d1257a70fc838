use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Robot identifier as assigned by the store.
pub type RobotId = i64;

/// Owner (user) identifier.
pub type UserId = i64;

/// Planned trading interval of a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ActivationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `now` shifted by `guard` lies strictly inside the window.
    pub fn contains(&self, now: DateTime<Utc>, guard: chrono::Duration) -> bool {
        let shifted = now + guard;
        shifted > self.start && shifted < self.end
    }

    /// Local instant at which [`contains`](Self::contains) stops holding.
    pub fn closes_at(&self, guard: chrono::Duration) -> DateTime<Utc> {
        self.end - guard
    }
}

/// A paper-trading robot definition together with its realized statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub id: RobotId,
    pub owner_user_id: UserId,
    /// Source robot when this one was cloned as a favorite.
    pub parent_robot_id: Option<RobotId>,
    pub is_favorite: bool,
    pub is_active: bool,
    pub ticker: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub plan_start: DateTime<Utc>,
    pub plan_end: DateTime<Utc>,
    pub plan_yield: f64,
    /// Realized profit.
    pub fact_yield: f64,
    pub deals_count: i64,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Robot {
    pub fn window(&self) -> ActivationWindow {
        ActivationWindow::new(self.plan_start, self.plan_end)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Validate the editable fields before an update is written.
    pub fn check_for_update(&self) -> Result<(), AppError> {
        if self.ticker.trim().is_empty() {
            return Err(AppError::BadRequest("bad ticker".to_string()));
        }
        if self.buy_price == 0.0 {
            return Err(AppError::BadRequest("bad buy price".to_string()));
        }
        if self.sell_price == 0.0 {
            return Err(AppError::BadRequest("bad sell price".to_string()));
        }
        if self.plan_yield == 0.0 {
            return Err(AppError::BadRequest("bad plan yield".to_string()));
        }
        check_window(self.plan_start, self.plan_end)
    }

    /// Copy the schedule and price fields of a fresher persisted copy.
    pub fn refresh_plan_from(&mut self, persisted: &Robot) {
        self.is_active = persisted.is_active;
        self.activated_at = persisted.activated_at;
        self.deactivated_at = persisted.deactivated_at;
        self.plan_start = persisted.plan_start;
        self.plan_end = persisted.plan_end;
        self.buy_price = persisted.buy_price;
        self.sell_price = persisted.sell_price;
        self.ticker = persisted.ticker.clone();
        self.plan_yield = persisted.plan_yield;
    }
}

/// Validated input for a new robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotDraft {
    pub ticker: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub plan_start: DateTime<Utc>,
    pub plan_end: DateTime<Utc>,
    pub plan_yield: f64,
}

impl RobotDraft {
    /// Parse raw form values. Timestamps are RFC 3339.
    pub fn parse(
        ticker: &str,
        buy: &str,
        sell: &str,
        plan_yield: &str,
        plan_start: &str,
        plan_end: &str,
    ) -> Result<Self, AppError> {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return Err(AppError::BadRequest("bad ticker".to_string()));
        }

        let buy_price = parse_price(buy, "bad buy price")?;
        let sell_price = parse_price(sell, "bad sell price")?;
        let plan_start = parse_time(plan_start, "bad plan start")?;
        let plan_end = parse_time(plan_end, "bad plan end")?;
        let plan_yield = parse_price(plan_yield, "bad plan yield")?;

        check_window(plan_start, plan_end)?;

        Ok(Self {
            ticker: ticker.to_string(),
            buy_price,
            sell_price,
            plan_start,
            plan_end,
            plan_yield,
        })
    }
}

fn parse_price(raw: &str, message: &str) -> Result<f64, AppError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::BadRequest(message.to_string()))
}

fn parse_time(raw: &str, message: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::BadRequest(message.to_string()))
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), AppError> {
    if start >= end {
        return Err(AppError::BadRequest(
            "plan start should be earlier than plan end".to_string(),
        ));
    }
    Ok(())
}
