//! DexScreener-backed metrics source
//!
//! Aggregates every Solana pair of a token into one snapshot: liquidity,
//! transaction counts and volume are summed across pools; price changes come
//! from the deepest pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sources::MetricsSource;
use crate::types::{MetricsSnapshot, PoolInfo, TxnCounts};

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Txns {
    pub m5: Option<TxnCount>,
    pub h1: Option<TxnCount>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TxnCount {
    pub buys: u32,
    pub sells: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "priceChange")]
    pub price_change: Option<PriceChange>,
    pub txns: Option<Txns>,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
    /// Milliseconds since epoch
    #[serde(rename = "pairCreatedAt")]
    pub pair_created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

pub struct DexScreenerSource {
    client: reqwest::Client,
    base_url: String,
    chain_id: String,
}

impl DexScreenerSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            chain_id: "solana".to_string(),
        })
    }

    async fn get_token_pairs(&self, mint: &str) -> Result<Vec<DexPair>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("DexScreener {}: {}", status, body)));
        }

        let data: TokenPairsResponse = response.json().await?;
        Ok(data.pairs.unwrap_or_default())
    }
}

#[async_trait]
impl MetricsSource for DexScreenerSource {
    async fn fetch(&self, mint: &str) -> Result<MetricsSnapshot> {
        let pairs = self.get_token_pairs(mint).await?;
        let pairs: Vec<DexPair> = pairs
            .into_iter()
            .filter(|p| p.chain_id == self.chain_id)
            .collect();
        debug!(mint = %mint, pairs = pairs.len(), "DexScreener pairs fetched");
        snapshot_from_pairs(mint, &pairs, Utc::now())
    }

    fn name(&self) -> &str {
        "dexscreener"
    }
}

/// Fold all pairs of a token into one snapshot
pub fn snapshot_from_pairs(
    mint: &str,
    pairs: &[DexPair],
    fetched_at: DateTime<Utc>,
) -> Result<MetricsSnapshot> {
    if pairs.is_empty() {
        return Err(Error::NoData(mint.to_string()));
    }

    let liquidity_of = |p: &DexPair| p.liquidity.as_ref().and_then(|l| l.usd);

    let deepest = pairs
        .iter()
        .max_by(|a, b| {
            liquidity_of(a)
                .unwrap_or(0.0)
                .total_cmp(&liquidity_of(b).unwrap_or(0.0))
        })
        .ok_or_else(|| Error::NoData(mint.to_string()))?;

    let liquidity_usd = sum_present(pairs.iter().map(liquidity_of));
    let volume_5m = sum_present(pairs.iter().map(|p| p.volume.as_ref().and_then(|v| v.m5)));
    let volume_1h = sum_present(pairs.iter().map(|p| p.volume.as_ref().and_then(|v| v.h1)));
    let txns_5m = sum_txns(pairs.iter().map(|p| p.txns.as_ref().and_then(|t| t.m5)));
    let txns_1h = sum_txns(pairs.iter().map(|p| p.txns.as_ref().and_then(|t| t.h1)));

    let pair_created_at = pairs
        .iter()
        .filter_map(|p| p.pair_created_at)
        .min()
        .and_then(DateTime::from_timestamp_millis);

    let pools = pairs
        .iter()
        .map(|p| PoolInfo {
            dex_id: p.dex_id.clone(),
            pair_address: p.pair_address.clone(),
            liquidity_usd: liquidity_of(p),
        })
        .collect();

    Ok(MetricsSnapshot {
        mint: mint.to_string(),
        liquidity_usd,
        price_change_5m: deepest.price_change.as_ref().and_then(|pc| pc.m5),
        // Not published by DexScreener; legacy momentum falls back to 5m
        price_change_15m: None,
        txns_5m,
        txns_1h,
        volume_5m,
        volume_1h,
        pair_created_at,
        pools,
        fetched_at,
    })
}

fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn sum_txns(values: impl Iterator<Item = Option<TxnCount>>) -> Option<TxnCounts> {
    values.flatten().fold(None, |acc, t| {
        let acc: TxnCounts = acc.unwrap_or_default();
        Some(TxnCounts {
            buys: acc.buys.saturating_add(t.buys),
            sells: acc.sells.saturating_add(t.sells),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "schemaVersion": "1.0.0",
        "pairs": [
            {
                "chainId": "solana",
                "dexId": "raydium",
                "pairAddress": "PairA",
                "priceChange": {"m5": 4.5, "h1": 12.0},
                "txns": {"m5": {"buys": 30, "sells": 10}, "h1": {"buys": 100, "sells": 80}},
                "volume": {"m5": 1500.0, "h1": 9000.0},
                "liquidity": {"usd": 40000.0},
                "pairCreatedAt": 1700000000000
            },
            {
                "chainId": "solana",
                "dexId": "meteora",
                "pairAddress": "PairB",
                "priceChange": {"m5": -1.0},
                "txns": {"m5": {"buys": 2, "sells": 3}},
                "liquidity": {"usd": 5000.0},
                "pairCreatedAt": 1700000600000
            }
        ]
    }"#;

    #[test]
    fn test_aggregates_pairs() {
        let resp: TokenPairsResponse = serde_json::from_str(FIXTURE).unwrap();
        let pairs = resp.pairs.unwrap();
        let s = snapshot_from_pairs("mint", &pairs, Utc::now()).unwrap();

        assert_eq!(s.liquidity_usd, Some(45_000.0));
        assert_eq!(s.price_change_5m, Some(4.5));
        assert_eq!(s.txns_5m, Some(TxnCounts { buys: 32, sells: 13 }));
        assert_eq!(s.txns_1h, Some(TxnCounts { buys: 100, sells: 80 }));
        assert_eq!(s.volume_5m, Some(1500.0));
        assert_eq!(s.pools.len(), 2);
        assert_eq!(
            s.pair_created_at,
            DateTime::from_timestamp_millis(1_700_000_000_000)
        );
    }

    #[test]
    fn test_no_pairs_is_no_data() {
        let err = snapshot_from_pairs("mint", &[], Utc::now()).unwrap_err();
        assert!(matches!(err, Error::NoData(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_null_pairs_parse() {
        let resp: TokenPairsResponse =
            serde_json::from_str(r#"{"schemaVersion":"1.0.0","pairs":null}"#).unwrap();
        assert!(resp.pairs.is_none());
    }
}
