use crate::channel::{ChannelEvent, ChannelMessage, Envelope, TabChannel};
use crate::clock::Clock;
use crate::coordination::types::{CoordinatorConfig, TabId};
use crate::error::AppError;
use crate::market::book::compute_spread;
use crate::market::hyperliquid::{
    connect_feed, fetch_l2_book, ping_request, subscribe_request, FeedStream,
    L2_BOOK_SUBSCRIPTION, TRADES_SUBSCRIPTION,
};
use crate::market::types::{
    parse_feed_payload, ConnectionPhase, FeedEvent, OrderBookSnapshot, PriceLevel, Trade,
    TradeSide,
};
use crate::state::TabState;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const MOCK_BASE_PRICE: f64 = 100_000.0;
const MOCK_TICK: f64 = 0.5;
const MOCK_DEPTH: usize = 10;

enum StreamDirective {
    Continue,
    Close,
}

pub struct BridgeContext {
    tab_id: TabId,
    config: Arc<CoordinatorConfig>,
    state: TabState,
    channel: Arc<dyn TabChannel>,
    clock: Arc<dyn Clock>,
    http_client: Client,
    cancel: CancellationToken,
}

impl BridgeContext {
    pub fn new(
        tab_id: TabId,
        config: Arc<CoordinatorConfig>,
        state: TabState,
        channel: Arc<dyn TabChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tab_id,
            config,
            state,
            channel,
            clock,
            http_client: Client::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn post(&self, event: ChannelEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let kind = event.kind();
        let envelope = Envelope {
            sender: self.tab_id.clone(),
            message: ChannelMessage {
                event,
                timestamp: self.clock.now_ms(),
            },
        };
        if let Err(error) = self.channel.post(envelope) {
            warn!(tab_id = %self.tab_id, kind, %error, "failed to broadcast update");
        }
    }

    fn publish_status(&self, phase: ConnectionPhase, error: Option<String>) {
        self.state.update(|state| {
            state.phase = phase;
            state.last_error = error.clone();
        });
        self.post(ChannelEvent::ConnectionStatus { phase, error });
    }

    fn publish_book(&self, book: OrderBookSnapshot) {
        let now_ms = self.clock.now_ms();
        let spread = compute_spread(&book);
        self.state.update(|state| {
            state.book = book.clone();
            state.last_update_ms = Some(now_ms);
        });
        self.post(ChannelEvent::BookUpdate(book));
        self.post(ChannelEvent::SpreadRecompute(spread));
    }

    fn publish_trades(&self, trades: Vec<Trade>) {
        if trades.is_empty() {
            return;
        }
        let now_ms = self.clock.now_ms();
        let mut buffer = Vec::new();
        self.state.update(|state| {
            state.trades.extend(trades);
            state.last_update_ms = Some(now_ms);
            buffer = state.trades.to_vec();
        });
        self.post(ChannelEvent::TradesUpdate(buffer));
    }
}

/// Owning handle of a running bridge. Dropping it cancels the bridge.
pub struct BridgeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl BridgeHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            if !error.is_cancelled() {
                warn!(%error, "upstream bridge task failed");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_bridge(context: BridgeContext) -> BridgeHandle {
    let cancel = context.cancel.clone();
    let guard = cancel.clone().drop_guard();
    let task = tokio::spawn(async move {
        info!(
            tab_id = %context.tab_id,
            coin = %context.config.coin,
            mock = context.config.mock_mode,
            "upstream bridge starting"
        );
        if context.config.mock_mode {
            run_mock_producer(&context).await;
        } else {
            run_feed_bridge(&context).await;
        }
        context
            .state
            .update(|state| state.phase = ConnectionPhase::Disconnected);
        info!(tab_id = %context.tab_id, "upstream bridge stopped");
    });

    BridgeHandle {
        cancel,
        task,
        _guard: guard,
    }
}

async fn run_feed_bridge(context: &BridgeContext) {
    let config = &context.config;
    let mut first_attempt = true;
    loop {
        if context.cancel.is_cancelled() {
            break;
        }
        if !context.state.is_leader() {
            debug!(tab_id = %context.tab_id, "no longer leader, not reconnecting");
            break;
        }
        if !first_attempt {
            tokio::select! {
                _ = context.cancel.cancelled() => break,
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }
            if !context.state.is_leader() {
                break;
            }
        }
        first_attempt = false;

        context.publish_status(ConnectionPhase::Connecting, None);
        let connected = tokio::select! {
            _ = context.cancel.cancelled() => break,
            connected = connect_feed(&config.feed_url) => connected,
        };

        match connected {
            Ok(stream) => {
                context.state.record_upstream_session();
                info!(tab_id = %context.tab_id, url = %config.feed_url, "upstream connected");
                match run_session(context, stream).await {
                    Ok(()) => {
                        if !context.cancel.is_cancelled() {
                            info!(tab_id = %context.tab_id, "upstream closed");
                            context.publish_status(ConnectionPhase::Disconnected, None);
                        }
                    }
                    Err(error) => {
                        warn!(tab_id = %context.tab_id, %error, "upstream session failed");
                        context.publish_status(ConnectionPhase::Error, Some(error.to_string()));
                    }
                }
            }
            Err(error) => {
                warn!(tab_id = %context.tab_id, %error, "upstream connect failed");
                context.publish_status(
                    ConnectionPhase::Error,
                    Some(format!("connect failed: {error}")),
                );
            }
        }
    }
}

async fn run_session(context: &BridgeContext, stream: FeedStream) -> Result<(), AppError> {
    let config = &context.config;
    let (mut sink, mut source) = stream.split();

    for kind in [L2_BOOK_SUBSCRIPTION, TRADES_SUBSCRIPTION] {
        sink.send(Message::Text(subscribe_request(kind, &config.coin)?))
            .await?;
    }
    context.publish_status(ConnectionPhase::Connected, None);

    tokio::select! {
        _ = context.cancel.cancelled() => return Ok(()),
        bootstrap = fetch_l2_book(&context.http_client, &config.rest_url, &config.coin) => {
            match bootstrap {
                Ok(book) => context.publish_book(book),
                Err(error) => {
                    warn!(tab_id = %context.tab_id, %error, "book bootstrap failed, waiting for stream");
                }
            }
        }
    }

    let mut keepalive = tokio::time::interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = context.cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return Ok(());
            }
            _ = keepalive.tick() => {
                trace!(tab_id = %context.tab_id, "sending keepalive");
                sink.send(Message::Text(ping_request()?)).await?;
            }
            frame = source.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                if let StreamDirective::Close = handle_message(frame?, context) {
                    return Ok(());
                }
            }
        }
    }
}

fn handle_message(message: Message, context: &BridgeContext) -> StreamDirective {
    let mut payload = match message {
        Message::Text(text_payload) => text_payload.into_bytes(),
        Message::Binary(binary_payload) => binary_payload,
        Message::Close(_) => return StreamDirective::Close,
        _ => return StreamDirective::Continue,
    };

    match parse_feed_payload(payload.as_mut_slice()) {
        Ok(FeedEvent::Book(book)) => context.publish_book(book),
        Ok(FeedEvent::Trades(trades)) => context.publish_trades(trades),
        Ok(FeedEvent::Pong) => trace!(tab_id = %context.tab_id, "keepalive acknowledged"),
        Ok(FeedEvent::Ignored(channel)) => {
            debug!(tab_id = %context.tab_id, channel, "ignoring feed message");
        }
        Err(error) => {
            warn!(tab_id = %context.tab_id, %error, "dropping malformed feed message");
        }
    }
    StreamDirective::Continue
}

async fn run_mock_producer(context: &BridgeContext) {
    context.publish_status(ConnectionPhase::Connecting, None);
    context.state.record_upstream_session();
    context.publish_status(ConnectionPhase::Connected, None);

    let mut ticker = tokio::time::interval(context.config.mock_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut step = 0_u64;

    loop {
        tokio::select! {
            _ = context.cancel.cancelled() => break,
            _ = ticker.tick() => {
                step = step.saturating_add(1);
                let now_ms = context.clock.now_ms();
                context.publish_book(mock_book(&context.config.coin, step, now_ms));
                context.publish_trades(vec![mock_trade(&context.config.coin, step, now_ms)]);
            }
        }
    }
}

// Triangle wave around the base price, so the book moves but stays bounded.
fn mock_mid_price(step: u64) -> f64 {
    let phase = (step % 40) as f64;
    let offset = if phase < 20.0 { phase } else { 40.0 - phase };
    MOCK_BASE_PRICE + offset * MOCK_TICK
}

fn mock_book(coin: &str, step: u64, now_ms: i64) -> OrderBookSnapshot {
    let mid = mock_mid_price(step);
    let level = |depth: usize, price: f64| PriceLevel {
        price,
        size: 0.25 + depth as f64 * 0.1 + (step % 3) as f64 * 0.05,
        orders: depth as u32 + 1,
    };
    let bids = (0..MOCK_DEPTH)
        .map(|depth| level(depth, mid - MOCK_TICK * (depth + 1) as f64))
        .collect();
    let asks = (0..MOCK_DEPTH)
        .map(|depth| level(depth, mid + MOCK_TICK * (depth + 1) as f64))
        .collect();
    OrderBookSnapshot::new(coin.to_string(), now_ms, bids, asks)
}

fn mock_trade(coin: &str, step: u64, now_ms: i64) -> Trade {
    let upward_move = step % 2 == 0;
    Trade {
        coin: coin.to_string(),
        side: if upward_move {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        },
        price: mock_mid_price(step),
        size: 0.01 * ((step % 5) + 1) as f64,
        time_ms: now_ms,
        tid: step,
        hash: format!("mock-{step}"),
    }
}
