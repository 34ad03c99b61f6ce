use crate::error::AppError;
use crate::market::types::{L2BookWire, OrderBookSnapshot};
use reqwest::Client;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const L2_BOOK_SUBSCRIPTION: &str = "l2Book";
pub const TRADES_SUBSCRIPTION: &str = "trades";

#[derive(Debug, Serialize)]
struct SubscriptionWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    coin: &'a str,
}

#[derive(Debug, Serialize)]
struct SubscribeRequestWire<'a> {
    method: &'static str,
    subscription: SubscriptionWire<'a>,
}

#[derive(Debug, Serialize)]
struct PingRequestWire {
    method: &'static str,
}

pub fn subscribe_request(kind: &str, coin: &str) -> Result<String, AppError> {
    let request = SubscribeRequestWire {
        method: "subscribe",
        subscription: SubscriptionWire { kind, coin },
    };
    Ok(simd_json::serde::to_string(&request)?)
}

pub fn ping_request() -> Result<String, AppError> {
    Ok(simd_json::serde::to_string(&PingRequestWire { method: "ping" })?)
}

pub async fn connect_feed(feed_url: &str) -> Result<FeedStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(feed_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_l2_book(
    client: &Client,
    rest_url: &str,
    coin: &str,
) -> Result<OrderBookSnapshot, AppError> {
    let body = SubscriptionWire {
        kind: L2_BOOK_SUBSCRIPTION,
        coin,
    };
    let response = client
        .post(rest_url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
    let payload = response.json::<L2BookWire>().await?;
    payload.try_into()
}
