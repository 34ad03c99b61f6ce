use crate::coordination::types::TabId;
use crate::error::AppError;
use crate::market::types::{ConnectionPhase, OrderBookSnapshot, Spread, Trade};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    BookUpdate(OrderBookSnapshot),
    SpreadRecompute(Option<Spread>),
    PriceGrouping(f64),
    ConnectionStatus {
        phase: ConnectionPhase,
        error: Option<String>,
    },
    LeadershipChanged {
        leader_id: TabId,
    },
    LeaderResigned {
        leader_id: TabId,
    },
    TradesUpdate(Vec<Trade>),
}

impl ChannelEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BookUpdate(_) => "book_update",
            Self::SpreadRecompute(_) => "spread_recompute",
            Self::PriceGrouping(_) => "price_grouping",
            Self::ConnectionStatus { .. } => "connection_status",
            Self::LeadershipChanged { .. } => "leadership_changed",
            Self::LeaderResigned { .. } => "leader_resigned",
            Self::TradesUpdate(_) => "trades_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(flatten)]
    pub event: ChannelEvent,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: TabId,
    pub message: ChannelMessage,
}

pub trait TabChannel: Send + Sync {
    fn post(&self, envelope: Envelope) -> Result<(), AppError>;
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

#[derive(Debug)]
pub struct LocalChannel {
    sender: broadcast::Sender<Envelope>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl TabChannel for LocalChannel {
    fn post(&self, envelope: Envelope) -> Result<(), AppError> {
        // Nobody listening is not a failure for a best-effort channel.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

pub struct TabInbox {
    owner: TabId,
    receiver: broadcast::Receiver<Envelope>,
}

impl TabInbox {
    pub fn new(owner: TabId, channel: &dyn TabChannel) -> Self {
        Self {
            owner,
            receiver: channel.subscribe(),
        }
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.sender == self.owner => continue,
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(tab_id = %self.owner, skipped, "broadcast inbox lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
