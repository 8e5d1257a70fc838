//! Robot repository contract consumed by the supervisor and the workers.

use crate::error::Result;
use crate::types::{Robot, RobotDraft, RobotId, UserId};

/// Selector for [`RobotRepository::filter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotFilter {
    All,
    Ticker(String),
    Owner(UserId),
}

/// Durable store of robot definitions and trading statistics.
///
/// Implementations must be safe to call concurrently from the supervisor and
/// from any number of trading workers.
pub trait RobotRepository: Send + Sync {
    /// Insert a new inactive robot owned by `owner`.
    fn create(&self, owner: UserId, draft: &RobotDraft) -> Result<Robot>;

    /// Soft-delete a robot.
    fn delete(&self, id: RobotId) -> Result<()>;

    /// Fetch one non-deleted robot.
    fn get_robot(&self, id: RobotId) -> Result<Robot>;

    fn get_all_user_robots(&self, owner: UserId) -> Result<Vec<Robot>>;

    fn get_all_ticker_robots(&self, ticker: &str) -> Result<Vec<Robot>>;

    /// Every robot without a soft-delete timestamp.
    fn get_all_non_deleted(&self) -> Result<Vec<Robot>>;

    fn filter(&self, filter: &RobotFilter) -> Result<Vec<Robot>> {
        match filter {
            RobotFilter::All => self.get_all_non_deleted(),
            RobotFilter::Ticker(ticker) => self.get_all_ticker_robots(ticker),
            RobotFilter::Owner(owner) => self.get_all_user_robots(*owner),
        }
    }

    /// Set the active flag. Only allowed outside the plan window; returns
    /// whether the flag changed.
    fn activate(&self, id: RobotId) -> Result<bool>;

    /// Clear the active flag. Same window rule as [`activate`](Self::activate).
    fn deactivate(&self, id: RobotId) -> Result<bool>;

    /// Rewrite the editable fields of an inactive robot; returns whether a
    /// row was changed.
    fn update(&self, robot: &Robot) -> Result<bool>;

    /// Clone `source` for `owner` as a favorite.
    fn favorite(&self, source: &Robot, owner: UserId) -> Result<Robot>;

    /// Record realized profit and deal count.
    fn persist_trade_result(&self, id: RobotId, fact_yield: f64, deals_count: i64) -> Result<()>;
}
