use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use super::price_feed::{PriceFeed, TickStream};
use crate::error::{AppError, Result};
use crate::types::{FeedRequest, Tick};

/// Quote frame pushed by the upstream feed.
#[derive(Debug, Deserialize)]
struct QuoteMessage {
    buy_price: f64,
    sell_price: f64,
}

/// WebSocket price feed client.
///
/// Every call to [`PriceFeed::open_stream`] opens its own connection, sends a
/// subscribe request for the ticker and yields one [`Tick`] per text frame.
#[derive(Debug, Clone)]
pub struct WsPriceFeed {
    url: String,
}

impl WsPriceFeed {
    /// Create a new feed client for the given WebSocket URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_quote(text: &str) -> Result<Tick> {
    let quote: QuoteMessage = serde_json::from_str(text)
        .map_err(|e| AppError::Feed(format!("malformed quote: {}", e)))?;
    Ok(Tick::new(quote.buy_price, quote.sell_price))
}

impl PriceFeed for WsPriceFeed {
    fn open_stream<'a>(
        &'a self,
        ticker: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TickStream>> + Send + 'a>> {
        Box::pin(async move {
            info!("Connecting to price feed {} for {}", self.url, ticker);
            let (mut ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| AppError::Feed(e.to_string()))?;

            let request = serde_json::to_string(&FeedRequest::Subscribe {
                ticker: ticker.to_string(),
            })?;
            ws.send(Message::Text(request))
                .await
                .map_err(|e| AppError::Feed(e.to_string()))?;

            let stream = futures_util::stream::unfold(Some(ws), |state| async move {
                let mut ws = state?;
                loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            return Some((parse_quote(&text), Some(ws)));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws.send(Message::Pong(data)).await {
                                return Some((Err(AppError::Feed(e.to_string())), None));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Price feed closed");
                            return None;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Some((Err(AppError::Feed(e.to_string())), None));
                        }
                    }
                }
            });

            Ok(Box::pin(stream) as TickStream)
        })
    }
}
