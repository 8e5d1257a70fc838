use serde::{Deserialize, Serialize};

/// One quote from the price feed for a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Price at which the robot can buy.
    pub buy_price: f64,
    /// Price at which the robot can sell.
    pub sell_price: f64,
}

impl Tick {
    pub fn new(buy_price: f64, sell_price: f64) -> Self {
        Self {
            buy_price,
            sell_price,
        }
    }
}
