//! CLI command implementations

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::guard::{MemoryGuard, SysinfoProbe};
use crate::scheduler::{Collaborators, Scheduler};
use crate::sources::{
    DexScreenerSource, HeliusSource, MapSettings, MemoryStore, MetricsSource, TracingNotifier,
    TransactionSource,
};
use crate::types::Token;

/// Wrapped SOL, used to probe upstreams
const PROBE_MINT: &str = "So11111111111111111111111111111111111111112";

/// How often `start` logs a health summary
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn metrics_source(config: &Config) -> Result<Arc<DexScreenerSource>> {
    let source = DexScreenerSource::new(
        &config.sources.dexscreener_url,
        Duration::from_millis(config.sources.request_timeout_ms),
    )?;
    Ok(Arc::new(source))
}

fn transaction_source(config: &Config) -> Result<Option<Arc<HeliusSource>>> {
    if config.sources.helius_api_key.is_empty() {
        return Ok(None);
    }
    let source = HeliusSource::new(
        &config.sources.helius_api_key,
        &config.sources.helius_url,
        Duration::from_millis(config.sources.request_timeout_ms),
    )?;
    Ok(Some(Arc::new(source)))
}

async fn build(config: &Config) -> Result<(Arc<Scheduler>, Arc<MemoryStore>)> {
    let store = Arc::new(MemoryStore::from_config(&config.store));
    store.load().await.context("Failed to load store")?;

    let transactions = transaction_source(config)?;
    if transactions.is_none() && config.spam.enabled {
        warn!("No Helius API key configured, spam analysis disabled");
    }

    let scheduler = Scheduler::new(
        config,
        Collaborators {
            metrics: metrics_source(config)?,
            transactions: transactions.map(|t| t as Arc<dyn TransactionSource>),
            persistence: store.clone(),
            notifier: Arc::new(TracingNotifier),
            probe: Arc::new(SysinfoProbe::new()),
        },
    )?;
    scheduler.load_from_store().await?;
    Ok((scheduler, store))
}

/// Parse `key=value` overrides into a settings store
pub fn parse_settings(pairs: &[String]) -> Result<MapSettings> {
    let settings = MapSettings::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("Setting must look like key=value: {}", pair);
        };
        settings.set(key.trim(), value.trim());
    }
    Ok(settings)
}

/// Apply command-line overrides on top of the loaded configuration
pub fn apply_overrides(mut config: Config, pairs: &[String]) -> Result<Config> {
    if pairs.is_empty() {
        return Ok(config);
    }
    let settings = parse_settings(pairs)?;
    config.apply_settings(&settings)?;
    info!(count = pairs.len(), "Applied setting overrides");
    Ok(config)
}

/// Mints from a file: one per line, `#` comments and blank lines ignored
pub fn read_mints_file(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read mints file {}", path.display()))?;
    Ok(parse_mints(&data))
}

fn parse_mints(data: &str) -> Vec<String> {
    data.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run the scheduler until Ctrl-C
pub async fn start(config: &Config, mut mints: Vec<String>, mints_file: Option<&Path>) -> Result<()> {
    info!("Starting migration scout...");
    if let Some(path) = mints_file {
        mints.extend(read_mints_file(path)?);
    }

    let (scheduler, store) = build(config).await?;

    let mut registered = 0;
    for mint in &mints {
        match Token::new(mint, None, None) {
            Ok(token) => {
                if scheduler.register_token(token).await? {
                    registered += 1;
                }
            }
            Err(e) => warn!(mint = %mint, error = %e, "Skipping invalid mint"),
        }
    }
    info!(registered, "Seeded tokens");

    let runner = tokio::spawn(Arc::clone(&scheduler).run());
    let mut health_timer = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_timer.tick().await;

    loop {
        tokio::select! {
            _ = health_timer.tick() => {
                let report = scheduler.health().await;
                info!(
                    hot = report.queue_hot,
                    cold = report.queue_cold,
                    in_flight = report.in_flight,
                    monitoring = report.tokens.monitoring,
                    active = report.tokens.active,
                    archived = report.tokens.archived,
                    breaker = %report.breaker.state,
                    memory_mb = report.memory.memory_mb,
                    parallelism = report.tuning.max_parallelism,
                    completed = report.counters.completed_cycles,
                    "Health"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                scheduler.shutdown();
                break;
            }
        }
    }

    if let Err(e) = runner.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Err(e) = store.save().await {
        error!("Failed to save store: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

/// Score one token now and print the snapshot
pub async fn score(config: &Config, mint: &str) -> Result<()> {
    let token = Token::new(mint, None, None)?;
    let (scheduler, _store) = build(config).await?;
    scheduler.register_token(token).await?;

    let snapshot = scheduler.force_recompute(mint).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Probe upstreams once and print resource stats
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");
    let mut all_healthy = true;

    let metrics = metrics_source(config)?;
    let transactions = transaction_source(config)?;

    let (dex, helius) = futures::future::join(
        check_metrics(metrics.as_ref()),
        async {
            match &transactions {
                Some(source) => Some(check_transactions(source.as_ref()).await),
                None => None,
            }
        },
    )
    .await;

    print!("DexScreener... ");
    match dex {
        Ok(latency) => println!("OK ({}ms)", latency),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Helius... ");
    match helius {
        Some(Ok(latency)) => println!("OK ({}ms)", latency),
        Some(Err(e)) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
        None => println!("DISABLED (no API key, spam analysis off)"),
    }

    let guard = MemoryGuard::new(config.memory.clone(), Arc::new(SysinfoProbe::new()));
    let check = guard.check();
    println!(
        "Memory... {} MB ({}; soft {} MB, hard {} MB)",
        check.sample.memory_mb(),
        check.pressure,
        config.memory.soft_limit_mb,
        config.memory.hard_limit_mb
    );
    println!("CPU... {:.1}%", check.sample.cpu_pct);

    println!();
    if all_healthy {
        println!("All systems healthy");
        Ok(())
    } else {
        anyhow::bail!("One or more upstreams unhealthy")
    }
}

async fn check_metrics(source: &dyn MetricsSource) -> Result<u128> {
    let started = Instant::now();
    source.fetch(PROBE_MINT).await?;
    Ok(started.elapsed().as_millis())
}

async fn check_transactions(source: &dyn TransactionSource) -> Result<u128> {
    let started = Instant::now();
    source.fetch_recent_transactions(PROBE_MINT, 1).await?;
    Ok(started.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_reach_config() {
        let pairs = vec!["scoring.alpha = 0.4".to_string(), "lifecycle.score_floor=0.3".to_string()];
        let config = apply_overrides(Config::default(), &pairs).unwrap();
        assert_eq!(config.scoring.alpha, 0.4);
        assert_eq!(config.lifecycle.score_floor, 0.3);

        assert!(parse_settings(&["no-equals".to_string()]).is_err());
        assert!(apply_overrides(Config::default(), &["scoring.alpha=5".to_string()]).is_err());
    }

    #[test]
    fn test_parse_mints_skips_comments() {
        let data = "# seed list\nSo11111111111111111111111111111111111111112\n\n  abc  # trailing\n";
        assert_eq!(
            parse_mints(data),
            vec![
                "So11111111111111111111111111111111111111112".to_string(),
                "abc".to_string()
            ]
        );
    }
}
