//! Builderscan indexer entry point
//!
//! Runs one scan invocation, or one every `SCAN_INTERVAL_SECS` when set.

use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use builderscan_indexer::chain::{self, endpoint_label};
use builderscan_indexer::config::{IndexerConfig, StorageConfig};
use builderscan_indexer::{
    AttributionStore, ChainScanner, MemoryStore, ProportionalFee, RedisStore, ScanReport,
};

fn log_report(report: &ScanReport) {
    match report.to_json() {
        Ok(json) => info!("Scan finished: {}", json),
        Err(_) => info!("Scan finished: {:?}", report),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = IndexerConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(false)
        .init();

    info!("Starting builderscan indexer");
    info!("RPC endpoint: {}", endpoint_label(&config.rpc));

    let client = chain::connect(&config.rpc).await?;
    let store: Arc<dyn AttributionStore> = match &config.storage {
        StorageConfig::Redis { url, key_prefix } => {
            Arc::new(RedisStore::connect(url, key_prefix).await?)
        }
        StorageConfig::Snapshot { path } => {
            info!("Using snapshot store at {}", path.display());
            Arc::new(MemoryStore::open(path.clone())?)
        }
    };

    let scanner = ChainScanner::new(client, store, Arc::new(ProportionalFee::new(config.fee_rate)))
        .with_window(config.window)
        .with_retry(config.retry);

    let Some(period) = config.scan_interval else {
        return match scanner.run_once().await {
            Ok(report) => {
                log_report(&report);
                Ok(())
            }
            Err(e) => {
                error!("Scan failed, retry on the next trigger: {}", e);
                Err(e.into())
            }
        };
    };

    info!("Scanning every {:?}", period);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scanner.run_once().await {
                    Ok(report) => log_report(&report),
                    Err(e) => error!("Scan failed, retrying in {:?}: {}", period, e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
