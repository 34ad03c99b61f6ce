use crate::error::AppError;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const TRADE_BUFFER_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    pub orders: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Bids best-first (descending), asks best-first (ascending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub coin: String,
    pub time_ms: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    pub fn new(coin: String, time_ms: i64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        let mut snapshot = Self {
            coin,
            time_ms,
            bids,
            asks,
        };
        snapshot.sort_levels();
        snapshot
    }

    fn sort_levels(&mut self) {
        self.bids
            .sort_unstable_by(|lhs, rhs| rhs.price.total_cmp(&lhs.price));
        self.asks
            .sort_unstable_by(|lhs, rhs| lhs.price.total_cmp(&rhs.price));
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub coin: String,
    pub side: TradeSide,
    pub price: f64,
    pub size: f64,
    pub time_ms: i64,
    pub tid: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeBuffer {
    entries: VecDeque<Trade>,
    capacity: usize,
}

impl TradeBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, trade: Trade) {
        self.entries.push_front(trade);
        self.entries.truncate(self.capacity);
    }

    /// Trades arrive oldest first; the last one ends up at the front.
    pub fn extend(&mut self, trades: impl IntoIterator<Item = Trade>) {
        for trade in trades {
            self.push(trade);
        }
    }

    pub fn replace(&mut self, most_recent_first: Vec<Trade>) {
        self.entries = most_recent_first.into_iter().take(self.capacity).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Trade> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Trade> {
        self.entries.front()
    }
}

impl Default for TradeBuffer {
    fn default() -> Self {
        Self::with_capacity(TRADE_BUFFER_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub last_error: Option<String>,
    pub last_update_ms: Option<i64>,
    pub book: OrderBookSnapshot,
    pub trades: TradeBuffer,
    pub price_grouping: f64,
}

impl ConnectionState {
    pub fn new(price_grouping: f64) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            last_error: None,
            last_update_ms: None,
            book: OrderBookSnapshot::default(),
            trades: TradeBuffer::default(),
            price_grouping,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Book(OrderBookSnapshot),
    Trades(Vec<Trade>),
    Pong,
    Ignored(String),
}

#[derive(Debug, Deserialize)]
struct FeedFrameWire {
    channel: String,
    #[serde(default)]
    data: Option<FeedDataWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedDataWire {
    Book(L2BookWire),
    Trades(Vec<TradeWire>),
    #[allow(dead_code)]
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
pub struct L2BookWire {
    pub coin: String,
    pub time: i64,
    pub levels: Vec<Vec<LevelWire>>,
}

#[derive(Debug, Deserialize)]
pub struct LevelWire {
    pub px: String,
    pub sz: String,
    pub n: u32,
}

#[derive(Debug, Deserialize)]
pub struct TradeWire {
    pub coin: String,
    pub side: String,
    pub px: String,
    pub sz: String,
    pub time: i64,
    pub tid: u64,
    #[serde(default)]
    pub hash: String,
}

impl TryFrom<&LevelWire> for PriceLevel {
    type Error = AppError;

    fn try_from(value: &LevelWire) -> Result<Self, Self::Error> {
        let price = value.px.parse::<f64>()?;
        let size = value.sz.parse::<f64>()?;
        if !price.is_finite() || !size.is_finite() || price <= 0.0 || size < 0.0 {
            return Err(AppError::MalformedFeed(
                "level price must be positive and size non-negative".to_string(),
            ));
        }
        Ok(Self {
            price,
            size,
            orders: value.n,
        })
    }
}

impl TryFrom<L2BookWire> for OrderBookSnapshot {
    type Error = AppError;

    fn try_from(value: L2BookWire) -> Result<Self, Self::Error> {
        let [bids, asks] = <[Vec<LevelWire>; 2]>::try_from(value.levels).map_err(|levels| {
            AppError::MalformedFeed(format!(
                "l2Book must carry exactly two sides, got {}",
                levels.len()
            ))
        })?;

        let bids = bids
            .iter()
            .map(PriceLevel::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let asks = asks
            .iter()
            .map(PriceLevel::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(value.coin, value.time, bids, asks))
    }
}

impl TryFrom<TradeWire> for Trade {
    type Error = AppError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        let side = match value.side.as_str() {
            "B" => TradeSide::Buy,
            "A" => TradeSide::Sell,
            other => {
                return Err(AppError::MalformedFeed(format!(
                    "unknown trade side '{other}'"
                )))
            }
        };
        let price = value.px.parse::<f64>()?;
        let size = value.sz.parse::<f64>()?;
        if !price.is_finite() || !size.is_finite() || price <= 0.0 || size < 0.0 {
            return Err(AppError::MalformedFeed(
                "trade price must be positive and size non-negative".to_string(),
            ));
        }

        Ok(Self {
            coin: value.coin,
            side,
            price,
            size,
            time_ms: value.time,
            tid: value.tid,
            hash: value.hash,
        })
    }
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<FeedEvent, AppError> {
    let frame: FeedFrameWire = simd_json::serde::from_slice(payload)?;

    match (frame.channel.as_str(), frame.data) {
        ("l2Book", Some(FeedDataWire::Book(book))) => Ok(FeedEvent::Book(book.try_into()?)),
        ("trades", Some(FeedDataWire::Trades(trades))) => {
            let trades = trades
                .into_iter()
                .map(Trade::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FeedEvent::Trades(trades))
        }
        ("l2Book", _) | ("trades", _) => Err(AppError::MalformedFeed(format!(
            "unexpected payload shape for channel '{}'",
            frame.channel
        ))),
        ("pong", _) => Ok(FeedEvent::Pong),
        _ => Ok(FeedEvent::Ignored(frame.channel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(tid: u64) -> Trade {
        Trade {
            coin: "BTC".to_string(),
            side: TradeSide::Buy,
            price: 100.0 + tid as f64,
            size: 0.5,
            time_ms: tid as i64,
            tid,
            hash: String::new(),
        }
    }

    #[test]
    fn parses_l2_book_and_sorts_sides() {
        let mut payload = br#"{"channel":"l2Book","data":{"coin":"BTC","time":1700000000000,"levels":[[{"px":"99.5","sz":"2","n":1},{"px":"100.0","sz":"1.5","n":3}],[{"px":"101.0","sz":"0.5","n":1},{"px":"100.5","sz":"4","n":2}]]}}"#.to_vec();

        let event = parse_feed_payload(&mut payload).expect("l2Book should parse");
        let FeedEvent::Book(book) = event else {
            panic!("expected a book event");
        };

        assert_eq!(book.coin, "BTC");
        assert_eq!(book.time_ms, 1_700_000_000_000);
        assert_eq!(book.best_bid().map(|level| level.price), Some(100.0));
        assert_eq!(book.best_ask().map(|level| level.price), Some(100.5));
        assert_eq!(book.bids[1].orders, 1);
    }

    #[test]
    fn parses_trade_batches() {
        let mut payload = br#"{"channel":"trades","data":[{"coin":"BTC","side":"B","px":"100.1","sz":"0.01","time":1,"hash":"0xab","tid":7},{"coin":"BTC","side":"A","px":"100.0","sz":"0.2","time":2,"hash":"0xcd","tid":8}]}"#.to_vec();

        let event = parse_feed_payload(&mut payload).expect("trades should parse");
        let FeedEvent::Trades(trades) = event else {
            panic!("expected a trades event");
        };

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, TradeSide::Buy);
        assert_eq!(trades[1].side, TradeSide::Sell);
        assert_eq!(trades[1].tid, 8);
    }

    #[test]
    fn recognizes_pong_and_ignores_other_channels() {
        let mut pong = br#"{"channel":"pong"}"#.to_vec();
        assert_eq!(parse_feed_payload(&mut pong).expect("pong"), FeedEvent::Pong);

        let mut ack = br#"{"channel":"subscriptionResponse","data":{"method":"subscribe","subscription":{"type":"l2Book","coin":"BTC"}}}"#.to_vec();
        assert_eq!(
            parse_feed_payload(&mut ack).expect("ack"),
            FeedEvent::Ignored("subscriptionResponse".to_string())
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut not_json = b"{not json".to_vec();
        assert!(parse_feed_payload(&mut not_json).is_err());

        let mut bad_price = br#"{"channel":"l2Book","data":{"coin":"BTC","time":1,"levels":[[{"px":"broken","sz":"1","n":1}],[]]}}"#.to_vec();
        assert!(parse_feed_payload(&mut bad_price).is_err());

        let mut one_side = br#"{"channel":"l2Book","data":{"coin":"BTC","time":1,"levels":[[]]}}"#.to_vec();
        assert!(parse_feed_payload(&mut one_side).is_err());

        let mut bad_side = br#"{"channel":"trades","data":[{"coin":"BTC","side":"X","px":"1","sz":"1","time":1,"tid":1}]}"#.to_vec();
        assert!(parse_feed_payload(&mut bad_side).is_err());
    }

    #[test]
    fn trade_buffer_keeps_most_recent_fifty_first() {
        let mut buffer = TradeBuffer::default();
        buffer.extend((1..=75).map(sample_trade));

        assert_eq!(buffer.len(), TRADE_BUFFER_CAPACITY);
        let tids: Vec<u64> = buffer.iter().map(|trade| trade.tid).collect();
        let expected: Vec<u64> = (26..=75).rev().collect();
        assert_eq!(tids, expected);
        assert_eq!(buffer.latest().map(|trade| trade.tid), Some(75));
    }

    #[test]
    fn replacing_trade_buffer_truncates_to_capacity() {
        let mut buffer = TradeBuffer::with_capacity(3);
        buffer.replace((1..=5).rev().map(sample_trade).collect());

        let tids: Vec<u64> = buffer.iter().map(|trade| trade.tid).collect();
        assert_eq!(tids, vec![5, 4, 3]);
    }
}
