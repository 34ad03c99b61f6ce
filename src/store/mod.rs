pub mod memory;

use crate::coordination::types::TabId;
use crate::error::AppError;
use std::future::Future;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

pub const DEFAULT_NAMESPACE: &str = "orderbook";

pub trait SharedStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn keys_with_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Push notification of changed keys, when the backend has one.
    ///
    /// Only a latency optimization: callers must stay correct when this
    /// returns `None` and they fall back to polling.
    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    heartbeat_prefix: String,
    leader_id: String,
    leader_heartbeat: String,
    election_token: String,
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            heartbeat_prefix: format!("{namespace}:heartbeat:"),
            leader_id: format!("{namespace}:leader_id"),
            leader_heartbeat: format!("{namespace}:leader_heartbeat"),
            election_token: format!("{namespace}:election"),
        }
    }

    pub fn heartbeat_prefix(&self) -> &str {
        &self.heartbeat_prefix
    }

    pub fn heartbeat(&self, tab_id: &TabId) -> String {
        format!("{}{}", self.heartbeat_prefix, tab_id)
    }

    pub fn tab_from_heartbeat_key(&self, key: &str) -> Option<TabId> {
        key.strip_prefix(self.heartbeat_prefix.as_str())
            .filter(|id| !id.is_empty())
            .map(TabId::from)
    }

    pub fn leader_id(&self) -> &str {
        &self.leader_id
    }

    pub fn leader_heartbeat(&self) -> &str {
        &self.leader_heartbeat
    }

    pub fn election_token(&self) -> &str {
        &self.election_token
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
