//! In-memory persistence with an optional JSON file
//!
//! Keeps every token and a bounded per-token snapshot history in memory. When
//! a path is configured, tokens and each token's latest snapshot are written
//! to disk after every change and reloaded on startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::sources::Persistence;
use crate::types::{ScoreSnapshot, Token};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    tokens: HashMap<String, Token>,
    latest: HashMap<String, ScoreSnapshot>,
}

#[derive(Default)]
struct StoreInner {
    tokens: HashMap<String, Token>,
    history: HashMap<String, VecDeque<ScoreSnapshot>>,
}

impl StoreInner {
    /// Timestamps and cycles must strictly increase per token
    fn check_order(&self, snapshot: &ScoreSnapshot) -> Result<()> {
        if let Some(last) = self.history.get(&snapshot.mint).and_then(|h| h.back()) {
            if snapshot.timestamp <= last.timestamp || snapshot.cycle <= last.cycle {
                return Err(Error::OutOfOrderSnapshot {
                    mint: snapshot.mint.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_transition(&self, token: &Token) -> Result<()> {
        match self.tokens.get(&token.mint) {
            Some(stored) if stored.status != token.status => {
                if stored.status.can_transition_to(token.status) {
                    Ok(())
                } else {
                    Err(Error::IllegalTransition {
                        mint: token.mint.clone(),
                        from: stored.status.to_string(),
                        to: token.status.to_string(),
                    })
                }
            }
            Some(_) => Ok(()),
            None => Err(Error::TokenNotFound(token.mint.clone())),
        }
    }

    fn push(&mut self, snapshot: ScoreSnapshot) {
        self.history
            .entry(snapshot.mint.clone())
            .or_default()
            .push_back(snapshot);
    }

    /// Drop the oldest entries beyond the cap. Runs only once a write is
    /// durable so a rollback can still restore them.
    fn trim(&mut self, mint: &str, max_history: usize) {
        if max_history == 0 {
            return;
        }
        if let Some(history) = self.history.get_mut(mint) {
            while history.len() > max_history {
                history.pop_front();
            }
        }
    }

    fn pop(&mut self, mint: &str) {
        if let Some(history) = self.history.get_mut(mint) {
            history.pop_back();
        }
    }
}

pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    path: Option<PathBuf>,
    max_history: usize,
    save_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(path: Option<PathBuf>, max_history: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            path,
            max_history,
            save_lock: Mutex::new(()),
        }
    }

    /// Purely in-memory store
    pub fn in_memory() -> Self {
        Self::new(None, 0)
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.path.as_ref().map(PathBuf::from), config.max_history_per_token)
    }

    /// Load tokens and latest snapshots from disk
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !Path::new(path).exists() {
            return Ok(());
        }
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let file: StoreFile =
            serde_json::from_str(&data).map_err(|e| Error::Persistence(e.to_string()))?;

        let mut inner = self.inner.write().await;
        inner.tokens = file.tokens;
        inner.history = file
            .latest
            .into_iter()
            .map(|(mint, snap)| (mint, VecDeque::from([snap])))
            .collect();
        info!(tokens = inner.tokens.len(), path = %path.display(), "Loaded store");
        Ok(())
    }

    /// Write tokens and latest snapshots to disk
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;

        let data = {
            let inner = self.inner.read().await;
            let file = StoreFile {
                tokens: inner.tokens.clone(),
                latest: inner
                    .history
                    .iter()
                    .filter_map(|(mint, h)| h.back().map(|s| (mint.clone(), s.clone())))
                    .collect(),
            };
            serde_json::to_string_pretty(&file).map_err(|e| Error::Persistence(e.to_string()))?
        };

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        debug!(path = %path.display(), "Saved store");
        Ok(())
    }

    /// Retained history of a token, oldest first
    pub async fn history(&self, mint: &str) -> Vec<ScoreSnapshot> {
        self.inner
            .read()
            .await
            .history
            .get(mint)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn token(&self, mint: &str) -> Option<Token> {
        self.inner.read().await.tokens.get(mint).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn append_score_snapshot(&self, snapshot: &ScoreSnapshot) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.check_order(snapshot)?;
            inner.push(snapshot.clone());
        }
        let saved = self.save().await;
        let mut inner = self.inner.write().await;
        match saved {
            Ok(()) => {
                inner.trim(&snapshot.mint, self.max_history);
                Ok(())
            }
            Err(e) => {
                inner.pop(&snapshot.mint);
                Err(e)
            }
        }
    }

    async fn update_token_status(&self, token: &Token) -> Result<()> {
        let previous = {
            let mut inner = self.inner.write().await;
            inner.check_transition(token)?;
            inner.tokens.insert(token.mint.clone(), token.clone())
        };
        if let Err(e) = self.save().await {
            if let Some(previous) = previous {
                self.inner.write().await.tokens.insert(previous.mint.clone(), previous);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn latest_snapshot(&self, mint: &str) -> Result<Option<ScoreSnapshot>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .get(mint)
            .and_then(|h| h.back().cloned()))
    }

    async fn upsert_token(&self, token: &Token) -> Result<()> {
        let inserted = {
            let mut inner = self.inner.write().await;
            if inner.tokens.contains_key(&token.mint) {
                false
            } else {
                inner.tokens.insert(token.mint.clone(), token.clone());
                true
            }
        };
        if inserted {
            self.save().await?;
        }
        Ok(())
    }

    async fn load_tokens(&self) -> Result<Vec<Token>> {
        Ok(self.inner.read().await.tokens.values().cloned().collect())
    }

    /// Snapshot and status change land together or not at all
    async fn commit_cycle(&self, snapshot: &ScoreSnapshot, token: Option<&Token>) -> Result<()> {
        let previous_token = {
            let mut inner = self.inner.write().await;
            inner.check_order(snapshot)?;
            let previous = match token {
                Some(token) => {
                    inner.check_transition(token)?;
                    inner.tokens.insert(token.mint.clone(), token.clone())
                }
                None => None,
            };
            inner.push(snapshot.clone());
            previous
        };

        let saved = self.save().await;
        let mut inner = self.inner.write().await;
        if let Err(e) = saved {
            inner.pop(&snapshot.mint);
            if let Some(previous) = previous_token {
                inner.tokens.insert(previous.mint.clone(), previous);
            }
            return Err(e);
        }
        inner.trim(&snapshot.mint, self.max_history);
        Ok(())
    }
}
