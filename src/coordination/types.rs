use crate::clock::age_ms;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_COIN: &str = "BTC";
pub const DEFAULT_FEED_URL: &str = "wss://api.hyperliquid.xyz/ws";
pub const DEFAULT_REST_URL: &str = "https://api.hyperliquid.xyz/info";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_LEADER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_ELECTION_DELAY_MS: u64 = 100;
pub const DEFAULT_STARTUP_DELAY_MS: u64 = 100;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_PRICE_GROUPING: f64 = 1.0;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const DEFAULT_MOCK_INTERVAL_MS: u64 = 250;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 50;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 10;
pub const MAX_RECONNECT_DELAY_MS: u64 = 300_000;
pub const MIN_KEEPALIVE_INTERVAL_MS: u64 = 1_000;
pub const MAX_KEEPALIVE_INTERVAL_MS: u64 = 300_000;
pub const MIN_MOCK_INTERVAL_MS: u64 = 10;
pub const MAX_MOCK_INTERVAL_MS: u64 = 10_000;

/// Ordering is lexicographic and decides elections.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    pub fn generate() -> Self {
        Self(format!("tab-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabRole {
    Follower,
    Electing,
    Leader,
}

impl fmt::Display for TabRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabRole::Follower => write!(f, "Follower"),
            TabRole::Electing => write!(f, "Electing"),
            TabRole::Leader => write!(f, "Leader"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadershipRecord {
    pub leader_id: Option<TabId>,
    pub leader_heartbeat: Option<i64>,
}

impl LeadershipRecord {
    /// Absent, half-written, or older than the timeout.
    pub fn is_stale(&self, now_ms: i64, leader_timeout: Duration) -> bool {
        match (&self.leader_id, self.leader_heartbeat) {
            (Some(_), Some(heartbeat)) => {
                age_ms(now_ms, heartbeat) > leader_timeout.as_millis() as i64
            }
            _ => true,
        }
    }

    pub fn names(&self, tab_id: &TabId) -> bool {
        self.leader_id.as_ref() == Some(tab_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionToken {
    pub id: String,
    pub timestamp: i64,
}

impl ElectionToken {
    pub fn new(timestamp: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp,
        }
    }

    pub fn encode(&self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        let mut bytes = raw.as_bytes().to_vec();
        Ok(simd_json::serde::from_slice(bytes.as_mut_slice())?)
    }

    /// A fresh token suppresses elections started by other tabs.
    pub fn is_fresh(&self, now_ms: i64, election_delay: Duration) -> bool {
        let age = age_ms(now_ms, self.timestamp);
        age >= 0 && age < 2 * election_delay.as_millis() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorArgs {
    pub coin: Option<String>,
    pub namespace: Option<String>,
    pub feed_url: Option<String>,
    pub rest_url: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub leader_timeout_ms: Option<u64>,
    pub election_delay_ms: Option<u64>,
    pub startup_delay_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub price_grouping: Option<f64>,
    pub mock_mode: Option<bool>,
    pub mock_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub coin: String,
    pub namespace: String,
    pub feed_url: String,
    pub rest_url: String,
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
    pub election_delay: Duration,
    pub startup_delay: Duration,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    pub price_grouping: f64,
    pub mock_mode: bool,
    pub mock_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coin: DEFAULT_COIN.to_string(),
            namespace: crate::store::DEFAULT_NAMESPACE.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            leader_timeout: Duration::from_millis(DEFAULT_LEADER_TIMEOUT_MS),
            election_delay: Duration::from_millis(DEFAULT_ELECTION_DELAY_MS),
            startup_delay: Duration::from_millis(DEFAULT_STARTUP_DELAY_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            price_grouping: DEFAULT_PRICE_GROUPING,
            mock_mode: DEFAULT_MOCK_MODE,
            mock_interval: Duration::from_millis(DEFAULT_MOCK_INTERVAL_MS),
        }
    }
}

pub fn validate_price_grouping(price_grouping: f64) -> Result<f64, AppError> {
    if !price_grouping.is_finite() || price_grouping <= 0.0 {
        return Err(AppError::InvalidArgument(
            "priceGrouping must be a finite positive number".to_string(),
        ));
    }
    Ok(price_grouping)
}

fn normalize_url(value: Option<String>, default: &str, schemes: &[&str]) -> Result<String, AppError> {
    let url = value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| default.to_string());
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(AppError::InvalidArgument(format!(
            "url '{url}' must start with one of {schemes:?}"
        )));
    }
    Ok(url)
}

fn ranged_ms(value: Option<u64>, default: u64, min: u64, max: u64, name: &str) -> Result<u64, AppError> {
    let value = value.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

impl CoordinatorArgs {
    pub fn normalize(self) -> Result<CoordinatorConfig, AppError> {
        let coin = self
            .coin
            .unwrap_or_else(|| DEFAULT_COIN.to_string())
            .trim()
            .to_ascii_uppercase();
        if coin.is_empty() || !coin.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "coin must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let namespace = self
            .namespace
            .unwrap_or_else(|| crate::store::DEFAULT_NAMESPACE.to_string())
            .trim()
            .to_string();
        if namespace.is_empty() || namespace.contains(':') {
            return Err(AppError::InvalidArgument(
                "namespace must be non-empty and must not contain ':'".to_string(),
            ));
        }

        let feed_url = normalize_url(self.feed_url, DEFAULT_FEED_URL, &["ws://", "wss://"])?;
        let rest_url = normalize_url(self.rest_url, DEFAULT_REST_URL, &["http://", "https://"])?;

        let heartbeat_ms = ranged_ms(
            self.heartbeat_interval_ms,
            DEFAULT_HEARTBEAT_INTERVAL_MS,
            MIN_HEARTBEAT_INTERVAL_MS,
            MAX_HEARTBEAT_INTERVAL_MS,
            "heartbeatIntervalMs",
        )?;
        let leader_timeout_ms = self.leader_timeout_ms.unwrap_or(DEFAULT_LEADER_TIMEOUT_MS);
        if leader_timeout_ms <= heartbeat_ms {
            return Err(AppError::InvalidArgument(
                "leaderTimeoutMs must be greater than heartbeatIntervalMs".to_string(),
            ));
        }
        let election_delay_ms = self.election_delay_ms.unwrap_or(DEFAULT_ELECTION_DELAY_MS);
        if election_delay_ms == 0 || election_delay_ms >= heartbeat_ms {
            return Err(AppError::InvalidArgument(
                "electionDelayMs must be positive and shorter than heartbeatIntervalMs".to_string(),
            ));
        }
        let startup_delay_ms = self.startup_delay_ms.unwrap_or(DEFAULT_STARTUP_DELAY_MS);
        if startup_delay_ms > heartbeat_ms {
            return Err(AppError::InvalidArgument(
                "startupDelayMs must not exceed heartbeatIntervalMs".to_string(),
            ));
        }
        let reconnect_delay_ms = ranged_ms(
            self.reconnect_delay_ms,
            DEFAULT_RECONNECT_DELAY_MS,
            MIN_RECONNECT_DELAY_MS,
            MAX_RECONNECT_DELAY_MS,
            "reconnectDelayMs",
        )?;
        let keepalive_ms = ranged_ms(
            self.keepalive_interval_ms,
            DEFAULT_KEEPALIVE_INTERVAL_MS,
            MIN_KEEPALIVE_INTERVAL_MS,
            MAX_KEEPALIVE_INTERVAL_MS,
            "keepaliveIntervalMs",
        )?;
        let price_grouping =
            validate_price_grouping(self.price_grouping.unwrap_or(DEFAULT_PRICE_GROUPING))?;
        let mock_mode = self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE);
        let mock_interval_ms = ranged_ms(
            self.mock_interval_ms,
            DEFAULT_MOCK_INTERVAL_MS,
            MIN_MOCK_INTERVAL_MS,
            MAX_MOCK_INTERVAL_MS,
            "mockIntervalMs",
        )?;

        Ok(CoordinatorConfig {
            coin,
            namespace,
            feed_url,
            rest_url,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            leader_timeout: Duration::from_millis(leader_timeout_ms),
            election_delay: Duration::from_millis(election_delay_ms),
            startup_delay: Duration::from_millis(startup_delay_ms),
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            keepalive_interval: Duration::from_millis(keepalive_ms),
            price_grouping,
            mock_mode,
            mock_interval: Duration::from_millis(mock_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = CoordinatorArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.coin, DEFAULT_COIN);
        assert_eq!(config.namespace, crate::store::DEFAULT_NAMESPACE);
        assert_eq!(config.feed_url, DEFAULT_FEED_URL);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2_000));
        assert_eq!(config.leader_timeout, Duration::from_millis(5_000));
        assert_eq!(config.election_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect_delay, Duration::from_millis(5_000));
        assert_eq!(config.price_grouping, DEFAULT_PRICE_GROUPING);
        assert!(!config.mock_mode);
    }

    #[test]
    fn uppercases_coin_and_rejects_symbols() {
        let config = CoordinatorArgs {
            coin: Some(" eth ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("lowercase coin is accepted");
        assert_eq!(config.coin, "ETH");

        let result = CoordinatorArgs {
            coin: Some("ETH/USD".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn leader_timeout_must_exceed_heartbeat() {
        let result = CoordinatorArgs {
            heartbeat_interval_ms: Some(2_000),
            leader_timeout_ms: Some(2_000),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn election_delay_must_fit_inside_heartbeat() {
        let result = CoordinatorArgs {
            heartbeat_interval_ms: Some(100),
            leader_timeout_ms: Some(300),
            election_delay_ms: Some(100),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_positive_grouping_and_bad_urls() {
        assert!(validate_price_grouping(0.0).is_err());
        assert!(validate_price_grouping(f64::NAN).is_err());
        assert_eq!(validate_price_grouping(0.5).expect("valid"), 0.5);

        let result = CoordinatorArgs {
            feed_url: Some("https://not-a-socket".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn missing_or_old_leadership_is_stale() {
        let timeout = Duration::from_millis(5_000);
        assert!(LeadershipRecord::default().is_stale(10_000, timeout));

        let half_written = LeadershipRecord {
            leader_id: Some(TabId::from("A")),
            leader_heartbeat: None,
        };
        assert!(half_written.is_stale(10_000, timeout));

        let record = LeadershipRecord {
            leader_id: Some(TabId::from("A")),
            leader_heartbeat: Some(5_000),
        };
        assert!(!record.is_stale(10_000, timeout));
        assert!(record.is_stale(10_001, timeout));
        assert!(record.names(&TabId::from("A")));
        assert!(!record.names(&TabId::from("B")));
    }

    #[test]
    fn election_token_freshness_spans_two_delays() {
        let delay = Duration::from_millis(100);
        let token = ElectionToken::new(1_000);
        assert!(token.is_fresh(1_000, delay));
        assert!(token.is_fresh(1_199, delay));
        assert!(!token.is_fresh(1_200, delay));
        assert!(!token.is_fresh(900, delay));

        let decoded = ElectionToken::decode(&token.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, token);
    }

    #[test]
    fn tab_ids_sort_lexicographically_and_are_unique() {
        let mut ids = vec![TabId::from("C"), TabId::from("A"), TabId::from("B")];
        ids.sort();
        assert_eq!(ids, vec![TabId::from("A"), TabId::from("B"), TabId::from("C")]);
        assert_ne!(TabId::generate(), TabId::generate());
    }
}
