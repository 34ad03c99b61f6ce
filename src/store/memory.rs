use crate::error::AppError;
use crate::store::SharedStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
            changes: broadcast::channel(CHANGE_FEED_CAPACITY).0,
        }
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn used_bytes(entries: &BTreeMap<String, String>) -> usize {
        entries
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    fn notify(&self, key: &str) {
        // No subscribers is the common case.
        let _ = self.changes.send(key.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        {
            let mut writable = self.entries.write();
            if let Some(quota) = self.quota_bytes {
                let previous = writable
                    .get(key)
                    .map(|old| key.len() + old.len())
                    .unwrap_or(0);
                let projected = Self::used_bytes(&writable) - previous + key.len() + value.len();
                if projected > quota {
                    return Err(AppError::StorageQuotaExceeded {
                        key: key.to_string(),
                    });
                }
            }
            writable.insert(key.to_string(), value.to_string());
        }
        self.notify(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let readable = self.entries.read();
        Ok(readable
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}
