use crate::channel::ChannelEvent;
use crate::coordination::types::{TabId, TabRole};
use crate::market::book::{compute_spread, group_book};
use crate::market::types::{ConnectionPhase, ConnectionState, OrderBookSnapshot, Spread};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct TabState {
    connection: Arc<watch::Sender<ConnectionState>>,
    role: Arc<watch::Sender<TabRole>>,
    known_leader: Arc<watch::Sender<Option<TabId>>>,
    upstream_sessions: Arc<AtomicU64>,
}

impl TabState {
    pub fn new(price_grouping: f64) -> Self {
        Self {
            connection: Arc::new(watch::channel(ConnectionState::new(price_grouping)).0),
            role: Arc::new(watch::channel(TabRole::Follower).0),
            known_leader: Arc::new(watch::channel(None).0),
            upstream_sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn update(&self, modify: impl FnOnce(&mut ConnectionState)) {
        self.connection.send_modify(modify);
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.connection.borrow().phase
    }

    pub fn book(&self) -> OrderBookSnapshot {
        self.connection.borrow().book.clone()
    }

    pub fn grouped_book(&self) -> OrderBookSnapshot {
        let readable = self.connection.borrow();
        group_book(&readable.book, readable.price_grouping)
    }

    pub fn spread(&self) -> Option<Spread> {
        compute_spread(&self.connection.borrow().book)
    }

    pub fn price_grouping(&self) -> f64 {
        self.connection.borrow().price_grouping
    }

    pub fn role(&self) -> TabRole {
        *self.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == TabRole::Leader
    }

    pub fn subscribe_role(&self) -> watch::Receiver<TabRole> {
        self.role.subscribe()
    }

    pub(crate) fn set_role(&self, role: TabRole) {
        self.role.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            *current = role;
            true
        });
    }

    pub fn known_leader(&self) -> Option<TabId> {
        self.known_leader.borrow().clone()
    }

    pub(crate) fn set_known_leader(&self, leader: Option<TabId>) {
        self.known_leader.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
    }

    pub fn upstream_sessions(&self) -> u64 {
        self.upstream_sessions.load(Ordering::Relaxed)
    }

    pub(crate) fn record_upstream_session(&self) {
        self.upstream_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// A tab that holds the upstream itself keeps its own data and status;
    /// grouping changes apply everywhere.
    pub fn apply_remote_event(&self, event: &ChannelEvent, now_ms: i64) {
        let holds_upstream = self.is_leader();
        match event {
            ChannelEvent::PriceGrouping(grouping) => {
                let grouping = *grouping;
                if grouping.is_finite() && grouping > 0.0 {
                    self.update(|state| state.price_grouping = grouping);
                }
            }
            ChannelEvent::BookUpdate(book) if !holds_upstream => {
                self.update(|state| {
                    state.book = book.clone();
                    state.last_update_ms = Some(now_ms);
                });
            }
            ChannelEvent::TradesUpdate(trades) if !holds_upstream => {
                self.update(|state| {
                    state.trades.replace(trades.clone());
                    state.last_update_ms = Some(now_ms);
                });
            }
            ChannelEvent::ConnectionStatus { phase, error } if !holds_upstream => {
                let phase = *phase;
                self.update(|state| {
                    state.phase = phase;
                    state.last_error = error.clone();
                });
            }
            // Spread is derived from the book; nudge observers so they recompute.
            ChannelEvent::SpreadRecompute(_) if !holds_upstream => {
                self.connection.send_modify(|_| {});
            }
            ChannelEvent::LeadershipChanged { leader_id } => {
                self.set_known_leader(Some(leader_id.clone()));
            }
            ChannelEvent::LeaderResigned { leader_id } => {
                if self.known_leader().as_ref() == Some(leader_id) {
                    self.set_known_leader(None);
                }
            }
            _ => {}
        }
    }
}
