//! CLOB WebSocket protocol for orderbook streaming.
//!
//! One `StreamClient` wraps a single physical connection; the scanner opens
//! several and shards its asset list across them.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

/// Close code used when force-closing a silent connection.
pub const ZOMBIE_CLOSE_CODE: u16 = 4000;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("WebSocket connection failed: {0}")]
    Connection(#[from] WsError),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single price level on the wire (string-encoded decimals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

impl WireLevel {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }

    pub fn size_decimal(&self) -> Option<Decimal> {
        self.size.parse().ok()
    }
}

/// Full-ladder snapshot for one asset.
#[derive(Debug, Clone, Deserialize)]
pub struct BookEvent {
    pub asset_id: String,
    /// Bids (buy orders). May be named "buys" in some API versions.
    #[serde(alias = "buys", default)]
    pub bids: Vec<WireLevel>,
    /// Asks (sell orders). May be named "sells" in some API versions.
    #[serde(alias = "sells", default)]
    pub asks: Vec<WireLevel>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl BookEvent {
    /// Best bid price (highest bid). Does not rely on API sort order.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().filter_map(|l| l.price_decimal()).max()
    }

    /// Best ask price (lowest ask). Does not rely on API sort order.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().filter_map(|l| l.price_decimal()).min()
    }

    /// Size resting at the best ask.
    pub fn ask_size_at_best(&self) -> Option<Decimal> {
        let best = self.best_ask()?;
        self.asks
            .iter()
            .find(|l| l.price_decimal() == Some(best))
            .and_then(|l| l.size_decimal())
    }
}

/// An incremental level update for one asset.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeEvent {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    /// "BUY" or "SELL".
    pub side: String,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
}

impl PriceChangeEvent {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }

    pub fn size_decimal(&self) -> Option<Decimal> {
        self.size.parse().ok()
    }

    pub fn best_bid_decimal(&self) -> Option<Decimal> {
        self.best_bid.as_ref().and_then(|p| p.parse().ok())
    }

    pub fn best_ask_decimal(&self) -> Option<Decimal> {
        self.best_ask.as_ref().and_then(|p| p.parse().ok())
    }
}

/// All stream events the scanner consumes.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Book(BookEvent),
    /// Batch of book snapshots (initial subscription response).
    Books(Vec<BookEvent>),
    PriceChanges(Vec<PriceChangeEvent>),
    Ping,
    /// Empty acknowledgement.
    Ack,
    Unknown(String),
}

/// Parse a raw text frame into a stream event.
pub fn parse_event(text: &str) -> StreamEvent {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(arr) = value.as_array() {
            if arr.is_empty() {
                return StreamEvent::Ack;
            }
            let books: Vec<BookEvent> = arr
                .iter()
                .filter(|v| v.get("event_type").and_then(|e| e.as_str()) == Some("book"))
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect();
            if !books.is_empty() {
                return StreamEvent::Books(books);
            }
        }

        if let Some(event_type) = value.get("event_type").and_then(|v| v.as_str()) {
            match event_type {
                "book" => {
                    if let Ok(book) = serde_json::from_value::<BookEvent>(value) {
                        return StreamEvent::Book(book);
                    }
                }
                "price_change" => {
                    // Either a batched form carrying `price_changes`, or a
                    // flat single-change object.
                    if let Some(changes) = value.get("price_changes") {
                        if let Ok(changes) =
                            serde_json::from_value::<Vec<PriceChangeEvent>>(changes.clone())
                        {
                            return StreamEvent::PriceChanges(changes);
                        }
                    }
                    if let Ok(change) = serde_json::from_value::<PriceChangeEvent>(value) {
                        return StreamEvent::PriceChanges(vec![change]);
                    }
                }
                _ => {}
            }
        }
    }

    if text == "ping" || text.contains("\"type\":\"ping\"") {
        return StreamEvent::Ping;
    }

    StreamEvent::Unknown(text.to_string())
}

/// Subscription request for the market channel.
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub assets_ids: Vec<String>,
}

impl SubscribeRequest {
    pub fn market(asset_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market".to_string(),
            assets_ids: asset_ids,
        }
    }
}

/// WebSocket client for one market-channel connection.
pub struct StreamClient {
    ws_url: String,
}

impl StreamClient {
    /// Create a client for the market channel of the given base WS URL.
    pub fn new(ws_base_url: &str) -> Self {
        Self {
            ws_url: format!("{}/market", ws_base_url),
        }
    }

    /// Connect to the WebSocket.
    pub async fn connect(&self) -> Result<WsStream, StreamError> {
        debug!("Connecting to CLOB WebSocket: {}", self.ws_url);

        let connect_timeout = Duration::from_secs(30);
        let (ws, _) = timeout(connect_timeout, connect_async(&self.ws_url))
            .await
            .map_err(|_| StreamError::Timeout)?
            .map_err(StreamError::Connection)?;

        Ok(ws)
    }

    /// Subscribe to orderbook updates for the given assets.
    /// Subscriptions are batched to avoid hitting server frame limits.
    pub async fn subscribe(
        &self,
        ws: &mut WsStream,
        asset_ids: &[String],
    ) -> Result<(), StreamError> {
        const BATCH_SIZE: usize = 100;
        let total_batches = asset_ids.len().div_ceil(BATCH_SIZE);

        info!(
            "Subscribing to {} assets in {} batches",
            asset_ids.len(),
            total_batches
        );

        for (batch_num, chunk) in asset_ids.chunks(BATCH_SIZE).enumerate() {
            let request = SubscribeRequest::market(chunk.to_vec());
            let msg =
                serde_json::to_string(&request).map_err(|e| StreamError::Encode(e.to_string()))?;

            ws.send(Message::Text(msg.into()))
                .await
                .map_err(StreamError::Connection)?;

            if batch_num + 1 < total_batches {
                sleep(Duration::from_millis(100)).await;
            }
        }

        Ok(())
    }

    /// Read the next event from the WebSocket.
    pub async fn read_event(&self, ws: &mut WsStream) -> Result<Option<StreamEvent>, StreamError> {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(parse_event(&text))),
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data))
                    .await
                    .map_err(StreamError::Connection)?;
                Ok(Some(StreamEvent::Ping))
            }
            Some(Ok(Message::Close(_))) => {
                debug!("WebSocket closed by server");
                Err(StreamError::Closed)
            }
            Some(Ok(_)) => Ok(None), // Binary, Pong, Frame
            Some(Err(e)) => Err(StreamError::Connection(e)),
            None => Err(StreamError::Closed),
        }
    }

    /// Send a keepalive ping.
    pub async fn send_ping(&self, ws: &mut WsStream) -> Result<(), StreamError> {
        ws.send(Message::Ping(vec![].into()))
            .await
            .map_err(StreamError::Connection)?;
        Ok(())
    }

    /// Close with an application close code (e.g. the zombie watchdog's 4000).
    pub async fn close_with_code(&self, ws: &mut WsStream, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        // The connection may already be gone; the listen loop handles that.
        let _ = ws.close(Some(frame)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_event() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "123",
            "market": "condition-456",
            "bids": [{"price": "0.55", "size": "100"}, {"price": "0.54", "size": "40"}],
            "asks": [{"price": "0.58", "size": "200"}, {"price": "0.56", "size": "25"}],
            "timestamp": "1704067200000"
        }"#;

        match parse_event(json) {
            StreamEvent::Book(book) => {
                assert_eq!(book.asset_id, "123");
                assert_eq!(book.best_bid(), Some(dec!(0.55)));
                assert_eq!(book.best_ask(), Some(dec!(0.56)));
                assert_eq!(book.ask_size_at_best(), Some(dec!(25)));
            }
            other => panic!("Expected Book, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_flat_price_change() {
        let json = r#"{
            "event_type": "price_change",
            "asset_id": "123",
            "price": "0.56",
            "size": "50",
            "side": "SELL",
            "best_bid": "0.55",
            "best_ask": "0.56"
        }"#;

        match parse_event(json) {
            StreamEvent::PriceChanges(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].side, "SELL");
                assert_eq!(changes[0].price_decimal(), Some(dec!(0.56)));
                assert_eq!(changes[0].best_ask_decimal(), Some(dec!(0.56)));
            }
            other => panic!("Expected PriceChanges, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_batched_price_changes() {
        let json = r#"{
            "event_type": "price_change",
            "market": "condition-456",
            "price_changes": [
                {"asset_id": "123", "price": "0.55", "size": "50", "side": "BUY",
                 "best_bid": "0.55", "best_ask": "0.56"},
                {"asset_id": "124", "price": "0.44", "size": "10", "side": "SELL",
                 "best_bid": "0.43", "best_ask": "0.44"}
            ],
            "timestamp": "1704067200000"
        }"#;

        match parse_event(json) {
            StreamEvent::PriceChanges(changes) => {
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].asset_id, "123");
                assert_eq!(changes[1].side, "SELL");
            }
            other => panic!("Expected PriceChanges, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_books_batch() {
        let json = r#"[
            {"event_type": "book", "asset_id": "1", "bids": [], "asks": [], "timestamp": "0"},
            {"event_type": "book", "asset_id": "2", "bids": [], "asks": [], "timestamp": "0"}
        ]"#;

        match parse_event(json) {
            StreamEvent::Books(books) => assert_eq!(books.len(), 2),
            other => panic!("Expected Books, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_array_is_ack() {
        match parse_event("[]") {
            StreamEvent::Ack => {}
            other => panic!("Expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_and_unknown() {
        assert!(matches!(parse_event("ping"), StreamEvent::Ping));
        assert!(matches!(parse_event("garbage"), StreamEvent::Unknown(_)));
    }

    #[test]
    fn test_subscribe_request_serialization() {
        let req = SubscribeRequest::market(vec!["token1".to_string()]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"market\""));
        assert!(json.contains("\"assets_ids\""));
    }

    #[test]
    fn test_book_event_missing_sides() {
        let json = r#"{"event_type": "book", "asset_id": "1", "bids": [], "asks": [], "timestamp": "0"}"#;
        match parse_event(json) {
            StreamEvent::Book(book) => {
                assert_eq!(book.best_bid(), None);
                assert_eq!(book.best_ask(), None);
                assert_eq!(book.ask_size_at_best(), None);
            }
            other => panic!("Expected Book, got {:?}", other),
        }
    }
}
