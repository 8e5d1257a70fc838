pub mod price_feed;
pub mod ws_feed;

pub use price_feed::{PriceFeed, TickStream};
pub use ws_feed::WsPriceFeed;
