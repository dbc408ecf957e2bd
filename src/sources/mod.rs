//! Collaborator contracts consumed by the pipeline, with concrete adapters
//!
//! - [`MetricsSource`]: market metrics per mint (DexScreener)
//! - [`TransactionSource`]: recent transaction samples (Helius)
//! - [`Persistence`]: snapshot history and token status (in-memory + JSON)
//! - [`NotificationSink`]: fire-and-forget operator alerts
//! - [`SettingsStore`]: runtime key/value overrides

pub mod dexscreener;
pub mod helius;
pub mod notify;
pub mod store;

pub use dexscreener::DexScreenerSource;
pub use helius::HeliusSource;
pub use notify::{ChannelNotifier, Notification, TracingNotifier};
pub use store::MemoryStore;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

use crate::error::Result;
use crate::types::{MetricsSnapshot, ScoreSnapshot, Token, TransactionSample};

/// Market metrics for one token
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self, mint: &str) -> Result<MetricsSnapshot>;

    fn name(&self) -> &str {
        "metrics"
    }
}

/// Recent on-chain transactions touching a token
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn fetch_recent_transactions(
        &self,
        mint: &str,
        limit: usize,
    ) -> Result<Vec<TransactionSample>>;
}

/// Snapshot history and token status storage
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append_score_snapshot(&self, snapshot: &ScoreSnapshot) -> Result<()>;

    async fn update_token_status(&self, token: &Token) -> Result<()>;

    async fn latest_snapshot(&self, mint: &str) -> Result<Option<ScoreSnapshot>>;

    /// Insert a token if its mint is unknown; existing tokens are untouched
    async fn upsert_token(&self, token: &Token) -> Result<()>;

    async fn load_tokens(&self) -> Result<Vec<Token>>;

    /// Persist one completed cycle. Stores that can make the pair atomic
    /// should override this.
    async fn commit_cycle(&self, snapshot: &ScoreSnapshot, token: Option<&Token>) -> Result<()> {
        self.append_score_snapshot(snapshot).await?;
        if let Some(token) = token {
            self.update_token_status(token).await?;
        }
        Ok(())
    }
}

/// Operator alert kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CircuitOpened,
    CircuitClosed,
    MemorySoft,
    MemoryHard,
    MemoryRecovered,
    BacklogHigh,
    TokenPromoted,
    TokenArchived,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::CircuitOpened => "circuit_opened",
            AlertKind::CircuitClosed => "circuit_closed",
            AlertKind::MemorySoft => "memory_soft",
            AlertKind::MemoryHard => "memory_hard",
            AlertKind::MemoryRecovered => "memory_recovered",
            AlertKind::BacklogHigh => "backlog_high",
            AlertKind::TokenPromoted => "token_promoted",
            AlertKind::TokenArchived => "token_archived",
        };
        write!(f, "{}", s)
    }
}

/// Fire-and-forget alert delivery. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: AlertKind, payload: serde_json::Value);
}

/// Runtime settings lookup. Absent keys resolve to configured defaults.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct MapSettings {
    values: DashMap<String, String>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

impl SettingsStore for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }
}

impl<K, V> FromIterator<(K, V)> for MapSettings
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values = DashMap::new();
        for (k, v) in iter {
            values.insert(k.into(), v.into());
        }
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_settings() {
        let settings: MapSettings = [("scoring.alpha", "0.4")].into_iter().collect();
        assert_eq!(settings.get("scoring.alpha").as_deref(), Some("0.4"));
        assert_eq!(settings.get("missing"), None);
        settings.remove("scoring.alpha");
        assert_eq!(settings.get("scoring.alpha"), None);
    }

    #[test]
    fn test_alert_kind_names() {
        assert_eq!(AlertKind::CircuitOpened.to_string(), "circuit_opened");
        assert_eq!(
            serde_json::to_string(&AlertKind::MemoryHard).unwrap(),
            r#""memory_hard""#
        );
    }
}
