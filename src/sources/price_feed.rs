//! Price feed contract: a lazy, ordered sequence of quotes per ticker.

use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::types::Tick;

/// Ordered tick sequence. `None` marks the natural end of the stream; an
/// `Err` item is terminal for the consumer.
pub type TickStream = Pin<Box<dyn Stream<Item = Result<Tick>> + Send>>;

/// Source of live quotes.
pub trait PriceFeed: Send + Sync {
    /// Open a tick stream for `ticker`.
    fn open_stream<'a>(
        &'a self,
        ticker: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TickStream>> + Send + 'a>>;
}
