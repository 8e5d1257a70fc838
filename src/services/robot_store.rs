//! SQLite persistence for robots.
//!
//! Timestamps are stored as epoch milliseconds. Deletion is soft: rows keep
//! their statistics and only gain a `deleted_at` stamp.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::services::repository::RobotRepository;
use crate::types::{Robot, RobotDraft, RobotId, UserId};

const ROBOT_COLUMNS: &str = "id, owner_user_id, parent_robot_id, is_favorite, is_active, ticker, \
     buy_price, sell_price, plan_start, plan_end, plan_yield, fact_yield, deals_count, \
     activated_at, deactivated_at, created_at, deleted_at";

/// SQLite-backed robot repository.
pub struct RobotStore {
    conn: Mutex<Connection>,
}

impl RobotStore {
    /// Open (or create) the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Robot store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory robot store initialized");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("robot store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS robots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_user_id INTEGER NOT NULL,
                parent_robot_id INTEGER,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 0,
                ticker TEXT NOT NULL,
                buy_price REAL NOT NULL,
                sell_price REAL NOT NULL,
                plan_start INTEGER NOT NULL,
                plan_end INTEGER NOT NULL,
                plan_yield REAL NOT NULL,
                fact_yield REAL NOT NULL DEFAULT 0,
                deals_count INTEGER NOT NULL DEFAULT 0,
                activated_at INTEGER,
                deactivated_at INTEGER,
                created_at INTEGER,
                deleted_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_robots_owner ON robots(owner_user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_robots_ticker ON robots(ticker)",
            [],
        )?;

        Ok(())
    }

    fn query_robots(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Robot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let robots = stmt
            .query_map(params, robot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(robots)
    }

    fn insert(
        &self,
        owner: UserId,
        parent: Option<RobotId>,
        is_favorite: bool,
        draft: &RobotDraft,
    ) -> Result<Robot> {
        let now = Utc::now();
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO robots (owner_user_id, parent_robot_id, is_favorite, is_active, ticker,
                    buy_price, sell_price, plan_start, plan_end, plan_yield, fact_yield, deals_count,
                    created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10)",
                params![
                    owner,
                    parent,
                    is_favorite,
                    draft.ticker,
                    draft.buy_price,
                    draft.sell_price,
                    draft.plan_start.timestamp_millis(),
                    draft.plan_end.timestamp_millis(),
                    draft.plan_yield,
                    now.timestamp_millis(),
                ],
            )?;
            conn.last_insert_rowid()
        };

        debug!("Created robot {} for user {} on {}", id, owner, draft.ticker);
        self.get_robot(id)
    }

    fn set_active(&self, id: RobotId, active: bool) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn()?;
        let stamp_column = if active { "activated_at" } else { "deactivated_at" };
        let changed = conn.execute(
            &format!(
                "UPDATE robots SET is_active = ?1, {stamp_column} = ?2
                 WHERE id = ?3 AND deleted_at IS NULL AND is_active = ?4
                   AND (?2 < plan_start OR ?2 > plan_end)"
            ),
            params![active, now, id, !active],
        )?;
        Ok(changed > 0)
    }
}

impl RobotRepository for RobotStore {
    fn create(&self, owner: UserId, draft: &RobotDraft) -> Result<Robot> {
        self.insert(owner, None, false, draft)
    }

    fn delete(&self, id: RobotId) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE robots SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![Utc::now().timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("robot {}", id)));
        }
        Ok(())
    }

    fn get_robot(&self, id: RobotId) -> Result<Robot> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ROBOT_COLUMNS} FROM robots WHERE id = ?1 AND deleted_at IS NULL"),
            params![id],
            robot_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("robot {}", id)))
    }

    fn get_all_user_robots(&self, owner: UserId) -> Result<Vec<Robot>> {
        self.query_robots(
            &format!(
                "SELECT {ROBOT_COLUMNS} FROM robots
                 WHERE owner_user_id = ?1 AND deleted_at IS NULL ORDER BY id"
            ),
            params![owner],
        )
    }

    fn get_all_ticker_robots(&self, ticker: &str) -> Result<Vec<Robot>> {
        self.query_robots(
            &format!(
                "SELECT {ROBOT_COLUMNS} FROM robots
                 WHERE ticker = ?1 AND deleted_at IS NULL ORDER BY id"
            ),
            params![ticker],
        )
    }

    fn get_all_non_deleted(&self) -> Result<Vec<Robot>> {
        self.query_robots(
            &format!("SELECT {ROBOT_COLUMNS} FROM robots WHERE deleted_at IS NULL ORDER BY id"),
            [],
        )
    }

    fn activate(&self, id: RobotId) -> Result<bool> {
        self.set_active(id, true)
    }

    fn deactivate(&self, id: RobotId) -> Result<bool> {
        self.set_active(id, false)
    }

    fn update(&self, robot: &Robot) -> Result<bool> {
        robot.check_for_update()?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE robots SET ticker = ?1, buy_price = ?2, sell_price = ?3, plan_start = ?4,
                plan_end = ?5, plan_yield = ?6
             WHERE id = ?7 AND is_active = 0 AND deleted_at IS NULL",
            params![
                robot.ticker,
                robot.buy_price,
                robot.sell_price,
                robot.plan_start.timestamp_millis(),
                robot.plan_end.timestamp_millis(),
                robot.plan_yield,
                robot.id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn favorite(&self, source: &Robot, owner: UserId) -> Result<Robot> {
        let draft = RobotDraft {
            ticker: source.ticker.clone(),
            buy_price: source.buy_price,
            sell_price: source.sell_price,
            plan_start: source.plan_start,
            plan_end: source.plan_end,
            plan_yield: source.plan_yield,
        };
        self.insert(owner, Some(source.id), true, &draft)
    }

    fn persist_trade_result(&self, id: RobotId, fact_yield: f64, deals_count: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE robots SET fact_yield = ?1, deals_count = ?2 WHERE id = ?3",
            params![fact_yield, deals_count, id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("robot {}", id)));
        }
        Ok(())
    }
}

fn millis_to_time(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

fn optional_time(ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(millis_to_time).transpose()
}

fn robot_from_row(row: &Row<'_>) -> rusqlite::Result<Robot> {
    Ok(Robot {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        parent_robot_id: row.get(2)?,
        is_favorite: row.get(3)?,
        is_active: row.get(4)?,
        ticker: row.get(5)?,
        buy_price: row.get(6)?,
        sell_price: row.get(7)?,
        plan_start: millis_to_time(row.get(8)?)?,
        plan_end: millis_to_time(row.get(9)?)?,
        plan_yield: row.get(10)?,
        fact_yield: row.get(11)?,
        deals_count: row.get(12)?,
        activated_at: optional_time(row.get(13)?)?,
        deactivated_at: optional_time(row.get(14)?)?,
        created_at: optional_time(row.get(15)?)?,
        deleted_at: optional_time(row.get(16)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(ticker: &str, start_offset_h: i64, end_offset_h: i64) -> RobotDraft {
        let now = Utc::now();
        RobotDraft {
            ticker: ticker.to_string(),
            buy_price: 100.0,
            sell_price: 110.0,
            plan_start: now + Duration::hours(start_offset_h),
            plan_end: now + Duration::hours(end_offset_h),
            plan_yield: 10.0,
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = RobotStore::new_in_memory().unwrap();
        let robot = store.create(7, &draft("AAPL", 1, 2)).unwrap();

        assert_eq!(robot.owner_user_id, 7);
        assert_eq!(robot.ticker, "AAPL");
        assert!(!robot.is_active);
        assert!(!robot.is_favorite);
        assert_eq!(robot.deals_count, 0);
        assert!(robot.created_at.is_some());

        let fetched = store.get_robot(robot.id).unwrap();
        assert_eq!(fetched, robot);
    }

    #[test]
    fn test_soft_delete_hides_robot() {
        let store = RobotStore::new_in_memory().unwrap();
        let robot = store.create(1, &draft("AAPL", 1, 2)).unwrap();

        store.delete(robot.id).unwrap();

        assert!(matches!(store.get_robot(robot.id), Err(AppError::NotFound(_))));
        assert!(store.get_all_non_deleted().unwrap().is_empty());
        assert!(matches!(store.delete(robot.id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_activate_only_outside_window() {
        let store = RobotStore::new_in_memory().unwrap();
        let future = store.create(1, &draft("AAPL", 1, 2)).unwrap();
        let running = store.create(1, &draft("MSFT", -1, 1)).unwrap();

        assert!(store.activate(future.id).unwrap());
        assert!(!store.activate(future.id).unwrap());
        assert!(store.get_robot(future.id).unwrap().activated_at.is_some());

        assert!(!store.activate(running.id).unwrap());
        assert!(!store.get_robot(running.id).unwrap().is_active);

        assert!(store.deactivate(future.id).unwrap());
        let robot = store.get_robot(future.id).unwrap();
        assert!(!robot.is_active);
        assert!(robot.deactivated_at.is_some());
    }

    #[test]
    fn test_update_rejected_while_active() {
        let store = RobotStore::new_in_memory().unwrap();
        let mut robot = store.create(1, &draft("AAPL", 1, 2)).unwrap();

        robot.buy_price = 90.0;
        assert!(store.update(&robot).unwrap());
        assert_eq!(store.get_robot(robot.id).unwrap().buy_price, 90.0);

        store.activate(robot.id).unwrap();
        robot.buy_price = 80.0;
        assert!(!store.update(&robot).unwrap());
        assert_eq!(store.get_robot(robot.id).unwrap().buy_price, 90.0);
    }

    #[test]
    fn test_update_validates_fields() {
        let store = RobotStore::new_in_memory().unwrap();
        let mut robot = store.create(1, &draft("AAPL", 1, 2)).unwrap();
        robot.ticker = String::new();
        assert!(matches!(store.update(&robot), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_favorite_clones_with_parent() {
        let store = RobotStore::new_in_memory().unwrap();
        let source = store.create(1, &draft("AAPL", 1, 2)).unwrap();
        store.persist_trade_result(source.id, 5.0, 2).unwrap();
        let source = store.get_robot(source.id).unwrap();

        let clone = store.favorite(&source, 2).unwrap();
        assert_ne!(clone.id, source.id);
        assert_eq!(clone.owner_user_id, 2);
        assert_eq!(clone.parent_robot_id, Some(source.id));
        assert!(clone.is_favorite);
        assert_eq!(clone.deals_count, 0);
        assert_eq!(clone.fact_yield, 0.0);
    }

    #[test]
    fn test_filters() {
        let store = RobotStore::new_in_memory().unwrap();
        store.create(1, &draft("AAPL", 1, 2)).unwrap();
        store.create(1, &draft("MSFT", 1, 2)).unwrap();
        store.create(2, &draft("AAPL", 1, 2)).unwrap();

        use crate::services::repository::RobotFilter;
        assert_eq!(store.filter(&RobotFilter::All).unwrap().len(), 3);
        assert_eq!(store.filter(&RobotFilter::Owner(1)).unwrap().len(), 2);
        assert_eq!(
            store.filter(&RobotFilter::Ticker("AAPL".to_string())).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_persist_trade_result() {
        let store = RobotStore::new_in_memory().unwrap();
        let robot = store.create(1, &draft("AAPL", 1, 2)).unwrap();

        store.persist_trade_result(robot.id, 17.0, 1).unwrap();

        let robot = store.get_robot(robot.id).unwrap();
        assert_eq!(robot.fact_yield, 17.0);
        assert_eq!(robot.deals_count, 1);
        assert!(matches!(
            store.persist_trade_result(9999, 1.0, 1),
            Err(AppError::NotFound(_))
        ));
    }
}
