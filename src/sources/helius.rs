//! Helius enhanced-transactions source for spam sampling

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sources::TransactionSource;
use crate::types::{TokenMovement, TransactionSample};

/// Helius caps enhanced transaction pages at 100
const MAX_PAGE: usize = 100;

pub struct HeliusSource {
    client: Client,
    api_key: String,
    rest_base_url: String,
}

impl HeliusSource {
    pub fn new(api_key: &str, rest_base_url: &str, timeout: Duration) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Helius API key is not set".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            rest_base_url: rest_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TransactionSource for HeliusSource {
    async fn fetch_recent_transactions(
        &self,
        mint: &str,
        limit: usize,
    ) -> Result<Vec<TransactionSample>> {
        let url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
            self.rest_base_url,
            mint,
            self.api_key,
            limit.clamp(1, MAX_PAGE)
        );

        debug!(mint = %mint, limit = limit, "Fetching transaction sample");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("Helius API error {}: {}", status, body)));
        }

        let transactions: Vec<HeliusTransaction> = response.json().await?;
        Ok(transactions.into_iter().map(to_sample).collect())
    }
}

#[derive(Debug, Deserialize)]
struct HeliusTransaction {
    signature: String,
    timestamp: Option<i64>,
    #[serde(rename = "feePayer")]
    fee_payer: Option<String>,
    #[serde(rename = "tokenTransfers", default)]
    token_transfers: Vec<TokenTransfer>,
    #[serde(default)]
    instructions: Vec<Instruction>,
}

#[derive(Debug, Deserialize)]
struct TokenTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    mint: String,
    #[serde(rename = "tokenAmount", default)]
    token_amount: f64,
}

#[derive(Debug, Deserialize)]
struct Instruction {
    #[serde(rename = "programId")]
    program_id: String,
    #[serde(rename = "innerInstructions", default)]
    inner_instructions: Vec<InnerInstruction>,
}

#[derive(Debug, Deserialize)]
struct InnerInstruction {
    #[serde(rename = "programId")]
    program_id: String,
}

fn to_sample(tx: HeliusTransaction) -> TransactionSample {
    let mut program_ids: Vec<String> = Vec::new();
    for ix in &tx.instructions {
        program_ids.push(ix.program_id.clone());
        program_ids.extend(ix.inner_instructions.iter().map(|i| i.program_id.clone()));
    }
    program_ids.sort();
    program_ids.dedup();

    TransactionSample {
        signature: tx.signature,
        fee_payer: tx.fee_payer.filter(|p| !p.is_empty()),
        program_ids,
        token_transfers: tx
            .token_transfers
            .into_iter()
            .map(|t| TokenMovement {
                from: t.from_user_account.filter(|a| !a.is_empty()),
                to: t.to_user_account.filter(|a| !a.is_empty()),
                mint: t.mint,
                amount: t.token_amount,
            })
            .collect(),
        timestamp: tx.timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0)),
    }
}
