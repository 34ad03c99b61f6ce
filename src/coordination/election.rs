//! Leader election over the shared store.
//!
//! There is no vote exchange: a tab that finds the leadership record stale
//! claims an election token, waits out the suppression window, and if its
//! token survived it picks the lowest live tab id as the winner. The store has
//! no compare-and-swap, so two tabs can still both commit. The demotion rule in
//! [`ElectionContext::decide`] folds such a split back to a single leader
//! within one heartbeat.

use crate::clock::{age_ms, Clock};
use crate::coordination::types::{
    CoordinatorConfig, ElectionToken, LeadershipRecord, TabId, TabRole,
};
use crate::store::{SharedStore, StoreKeys};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
    pub election_delay: Duration,
}

impl From<&CoordinatorConfig> for ElectionTiming {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            leader_timeout: config.leader_timeout,
            election_delay: config.election_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Elect,
    Promote,
    Demote,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won,
    Lost { winner: TabId },
    Suppressed,
    Superseded,
    Preempted { leader: TabId },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Promoted,
    Demoted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    pub change: Option<RoleChange>,
    pub recheck_after: Option<Duration>,
    pub leader: Option<TabId>,
}

pub struct ElectionContext<S> {
    id: TabId,
    store: Arc<S>,
    keys: StoreKeys,
    timing: ElectionTiming,
    clock: Arc<dyn Clock>,
    role: TabRole,
}

impl<S: SharedStore> ElectionContext<S> {
    pub fn new(
        id: TabId,
        store: Arc<S>,
        keys: StoreKeys,
        timing: ElectionTiming,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            store,
            keys,
            timing,
            clock,
            role: TabRole::Follower,
        }
    }

    pub fn id(&self) -> &TabId {
        &self.id
    }

    pub fn role(&self) -> TabRole {
        self.role
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(error) => {
                warn!(tab_id = %self.id, key, %error, "shared store read failed");
                None
            }
        }
    }

    /// `false` means the write must be treated as not committed.
    async fn write(&self, key: &str, value: &str) -> bool {
        match self.store.set(key, value).await {
            Ok(()) => true,
            Err(error) => {
                warn!(tab_id = %self.id, key, %error, "shared store write not committed");
                false
            }
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(error) = self.store.delete(key).await {
            warn!(tab_id = %self.id, key, %error, "shared store delete failed");
        }
    }

    pub async fn refresh_heartbeat(&self) -> bool {
        let now_ms = self.clock.now_ms();
        trace!(tab_id = %self.id, now_ms, "refreshing heartbeat");
        self.write(&self.keys.heartbeat(&self.id), &now_ms.to_string())
            .await
    }

    pub async fn read_leadership(&self) -> LeadershipRecord {
        let leader_id = self.read(self.keys.leader_id()).await.map(TabId::from);
        let leader_heartbeat = self
            .read(self.keys.leader_heartbeat())
            .await
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        LeadershipRecord {
            leader_id,
            leader_heartbeat,
        }
    }

    async fn read_token(&self) -> Option<ElectionToken> {
        let raw = self.read(self.keys.election_token()).await?;
        match ElectionToken::decode(&raw) {
            Ok(token) => Some(token),
            Err(error) => {
                debug!(tab_id = %self.id, %error, "ignoring unreadable election token");
                None
            }
        }
    }

    async fn write_leadership(&self) -> bool {
        let now_ms = self.clock.now_ms();
        let id_written = self.write(self.keys.leader_id(), self.id.as_str()).await;
        let heartbeat_written = self
            .write(self.keys.leader_heartbeat(), &now_ms.to_string())
            .await;
        id_written && heartbeat_written
    }

    /// Leader-only lease renewal. Never overwrites a live record naming
    /// another tab; yields instead.
    async fn renew_lease(&mut self) {
        let record = self.read_leadership().await;
        let now_ms = self.clock.now_ms();
        if !record.is_stale(now_ms, self.timing.leader_timeout) && !record.names(&self.id) {
            info!(
                tab_id = %self.id,
                leader = ?record.leader_id,
                "another tab holds leadership, stepping down"
            );
            self.role = TabRole::Follower;
            return;
        }

        if !self.write_leadership().await {
            warn!(tab_id = %self.id, "lease renewal not committed");
        }
    }

    pub fn decide(&self, record: &LeadershipRecord, now_ms: i64) -> Decision {
        if record.is_stale(now_ms, self.timing.leader_timeout) {
            return Decision::Elect;
        }

        let believes_leader = self.role == TabRole::Leader;
        match (record.names(&self.id), believes_leader) {
            (true, false) => Decision::Promote,
            (false, true) => Decision::Demote,
            _ => Decision::Hold,
        }
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let before = self.role;
        let mut recheck_after = None;

        self.refresh_heartbeat().await;
        if self.role == TabRole::Leader {
            self.renew_lease().await;
        }

        let yielded = before == TabRole::Leader && self.role == TabRole::Follower;
        if !yielded {
            let record = self.read_leadership().await;
            let now_ms = self.clock.now_ms();
            match self.decide(&record, now_ms) {
                Decision::Elect => match self.elect(cancel).await {
                    ElectionOutcome::Suppressed | ElectionOutcome::Superseded => {
                        recheck_after = Some(self.timing.election_delay);
                    }
                    outcome => {
                        debug!(tab_id = %self.id, ?outcome, "election finished");
                    }
                },
                Decision::Promote => {
                    info!(tab_id = %self.id, "leadership record names this tab, resuming as leader");
                    self.role = TabRole::Leader;
                }
                Decision::Demote => {
                    info!(tab_id = %self.id, leader = ?record.leader_id, "stepping down to follower");
                    self.role = TabRole::Follower;
                }
                Decision::Hold => {}
            }
        }

        let change = match (before == TabRole::Leader, self.role == TabRole::Leader) {
            (false, true) => Some(RoleChange::Promoted),
            (true, false) => Some(RoleChange::Demoted),
            _ => None,
        };

        CycleOutcome {
            change,
            recheck_after,
            leader: self.current_leader().await,
        }
    }

    async fn current_leader(&self) -> Option<TabId> {
        if self.role == TabRole::Leader {
            return Some(self.id.clone());
        }
        let record = self.read_leadership().await;
        if record.is_stale(self.clock.now_ms(), self.timing.leader_timeout) {
            None
        } else {
            record.leader_id
        }
    }

    pub async fn elect(&mut self, cancel: &CancellationToken) -> ElectionOutcome {
        let now_ms = self.clock.now_ms();
        if let Some(existing) = self.read_token().await {
            if existing.is_fresh(now_ms, self.timing.election_delay) {
                debug!(tab_id = %self.id, "election already in progress elsewhere");
                return ElectionOutcome::Suppressed;
            }
        }

        let token = ElectionToken::new(now_ms);
        let encoded = match token.encode() {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(tab_id = %self.id, %error, "failed to encode election token");
                return ElectionOutcome::Aborted;
            }
        };
        if !self.write(self.keys.election_token(), &encoded).await {
            return ElectionOutcome::Aborted;
        }

        let previous = self.role;
        self.role = TabRole::Electing;
        info!(tab_id = %self.id, "leadership stale, starting election");

        let outcome = self.confirm_election(&token, cancel).await;
        self.role = match outcome {
            ElectionOutcome::Won => TabRole::Leader,
            _ => previous,
        };

        if self.read_token().await.is_some_and(|stored| stored.id == token.id) {
            self.remove(self.keys.election_token()).await;
        }

        match &outcome {
            ElectionOutcome::Won => info!(tab_id = %self.id, "won election, now leader"),
            ElectionOutcome::Lost { winner } => {
                debug!(tab_id = %self.id, %winner, "election picked another tab")
            }
            other => debug!(tab_id = %self.id, outcome = ?other, "election abandoned"),
        }
        outcome
    }

    async fn confirm_election(
        &self,
        token: &ElectionToken,
        cancel: &CancellationToken,
    ) -> ElectionOutcome {
        tokio::select! {
            _ = cancel.cancelled() => return ElectionOutcome::Aborted,
            _ = tokio::time::sleep(self.timing.election_delay) => {}
        }

        match self.read_token().await {
            Some(stored) if stored.id == token.id => {}
            _ => return ElectionOutcome::Superseded,
        }

        let mut live = self.live_tabs().await;
        if !live.contains(&self.id) {
            live.push(self.id.clone());
            live.sort();
        }
        let winner = live.swap_remove(0);
        if winner != self.id {
            return ElectionOutcome::Lost { winner };
        }

        let record = self.read_leadership().await;
        if !record.is_stale(self.clock.now_ms(), self.timing.leader_timeout)
            && !record.names(&self.id)
        {
            if let Some(leader) = record.leader_id {
                return ElectionOutcome::Preempted { leader };
            }
        }

        if !self.write_leadership().await {
            return ElectionOutcome::Aborted;
        }
        ElectionOutcome::Won
    }

    /// Tabs with a fresh heartbeat, sorted. Stale or unreadable heartbeat
    /// records are deleted on the way.
    pub async fn live_tabs(&self) -> Vec<TabId> {
        let keys = match self
            .store
            .keys_with_prefix(self.keys.heartbeat_prefix())
            .await
        {
            Ok(keys) => keys,
            Err(error) => {
                warn!(tab_id = %self.id, %error, "failed to enumerate heartbeats");
                return Vec::new();
            }
        };

        let now_ms = self.clock.now_ms();
        let timeout_ms = self.timing.leader_timeout.as_millis() as i64;
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(tab_id) = self.keys.tab_from_heartbeat_key(&key) else {
                continue;
            };
            let beat = self
                .read(&key)
                .await
                .and_then(|raw| raw.trim().parse::<i64>().ok());
            match beat {
                Some(beat_ms) if age_ms(now_ms, beat_ms) <= timeout_ms => live.push(tab_id),
                _ => {
                    debug!(tab_id = %self.id, stale_tab = %tab_id, "collecting stale heartbeat");
                    self.remove(&key).await;
                }
            }
        }

        live.sort();
        live
    }

    pub async fn depart(&mut self) -> bool {
        let was_leader = self.role == TabRole::Leader;
        self.remove(&self.keys.heartbeat(&self.id)).await;

        if was_leader {
            let record = self.read_leadership().await;
            if record.leader_id.is_none() || record.names(&self.id) {
                self.remove(self.keys.leader_id()).await;
                self.remove(self.keys.leader_heartbeat()).await;
            }
            info!(tab_id = %self.id, "resigned leadership");
        }

        self.role = TabRole::Follower;
        was_leader
    }
}
