//! Chain Scanner
//!
//! Drives one bounded, resumable pass over the chain:
//! load cursor → fetch tip → plan range → fetch blocks → parse calldata → record
//! attributions → commit cursor → recompute stats.
//!
//! Blocks are fetched one at a time. A block that cannot be fetched is logged and skipped,
//! and the cursor still moves past it once the batch completes. Every write is idempotent, so
//! a pass interrupted before the commit is simply repeated by the next invocation.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregateError, StatsAggregator};
use crate::chain::{with_backoff, ChainBlock, ChainClient, ChainError, RetryConfig};
use crate::cursor::{BlockRange, CursorError, IndexerCursor, ScanWindow};
use crate::fee::FeeEstimator;
use crate::model::{wei_to_native, TxAttribution};
use crate::store::{AttributionStore, StoreError};
use crate::suffix::parse_builder_codes;

/// Errors that abort a scan invocation
///
/// None of these leave the cursor ahead of the data that was written.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Chain unavailable: every block in {start}..={end} failed to fetch")]
    ChainUnavailable { start: u64, end: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// A batch was scanned and the cursor committed
    Scanned,
    /// The cursor was already at the tip
    UpToDate,
}

/// Summary of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    /// First block of the batch (or the cursor when up to date)
    pub from_block: Option<u64>,
    /// Last block of the batch (or the cursor when up to date)
    pub to_block: Option<u64>,
    pub chain_tip: u64,
    pub scanned_blocks: u64,
    pub skipped_blocks: u64,
    /// `(tx, code)` pairs parsed from calldata, duplicates included
    pub attributions_found: u64,
    /// Pairs that were new to the store
    pub attributions_inserted: u64,
    pub codes_discovered: u64,
    /// Codes whose stats were rewritten by the aggregation pass
    pub stats_updated: usize,
}

impl ScanReport {
    fn scanned(range: BlockRange, chain_tip: u64) -> Self {
        Self {
            outcome: ScanOutcome::Scanned,
            from_block: Some(range.start),
            to_block: Some(range.end),
            chain_tip,
            scanned_blocks: 0,
            skipped_blocks: 0,
            attributions_found: 0,
            attributions_inserted: 0,
            codes_discovered: 0,
            stats_updated: 0,
        }
    }

    fn up_to_date(last_block: Option<u64>, chain_tip: u64) -> Self {
        Self {
            outcome: ScanOutcome::UpToDate,
            from_block: last_block,
            to_block: last_block,
            ..Self::scanned(BlockRange { start: 0, end: 0 }, chain_tip)
        }
    }

    /// Serialize the report to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Scans block ranges for attributed transactions
pub struct ChainScanner {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn AttributionStore>,
    fee: Arc<dyn FeeEstimator>,
    window: ScanWindow,
    retry: RetryConfig,
}

impl ChainScanner {
    /// Create a scanner with the default window and retry policy
    ///
    /// # Arguments
    /// * `client` - Chain the blocks are read from
    /// * `store` - Destination of attributions, stats and the cursor
    /// * `fee` - Fee estimation strategy applied to each attributed value
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn AttributionStore>,
        fee: Arc<dyn FeeEstimator>,
    ) -> Self {
        Self {
            client,
            store,
            fee,
            window: ScanWindow::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_window(mut self, window: ScanWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run one invocation
    ///
    /// On error the cursor is untouched and the next invocation resumes from the same block.
    pub async fn run_once(&self) -> Result<ScanReport, ScanError> {
        let mut cursor = IndexerCursor::load(self.store.as_ref()).await?;
        let tip = with_backoff(&self.retry, "eth_blockNumber", || self.client.block_number())
            .await
            .map_err(|e| {
                error!("Could not fetch chain tip, aborting scan: {}", e);
                e
            })?;

        let Some(range) = cursor.plan(tip, &self.window) else {
            info!(
                "Indexer up to date at block {:?} (tip {})",
                cursor.last_block(),
                tip
            );
            let mut report = ScanReport::up_to_date(cursor.last_block(), tip);
            report.stats_updated = self.recompute().await?;
            return Ok(report);
        };

        cursor.begin(range)?;
        info!(
            "Scanning blocks {}..={} ({} blocks, tip {})",
            range.start,
            range.end,
            range.block_count(),
            tip
        );

        let mut report = ScanReport::scanned(range, tip);
        if let Err(e) = self.scan_range(range, &mut report).await {
            cursor.abandon();
            error!("Scan of {}..={} aborted: {}", range.start, range.end, e);
            return Err(e);
        }

        cursor.commit(self.store.as_ref()).await?;
        report.stats_updated = self.recompute().await?;

        info!(
            "Scanned {} blocks ({} skipped): {} attributions found, {} new, {} new codes",
            report.scanned_blocks,
            report.skipped_blocks,
            report.attributions_found,
            report.attributions_inserted,
            report.codes_discovered
        );
        Ok(report)
    }

    async fn recompute(&self) -> Result<usize, ScanError> {
        let stats = StatsAggregator::new(self.store.clone())
            .recompute()
            .await
            .map_err(|e| {
                error!("Stats recompute failed: {}", e);
                e
            })?;
        Ok(stats.len())
    }

    async fn scan_range(&self, range: BlockRange, report: &mut ScanReport) -> Result<(), ScanError> {
        let mut fetch_failures = 0u64;

        for number in range.blocks() {
            let label = format!("eth_getBlockByNumber({})", number);
            let fetched = with_backoff(&self.retry, &label, || {
                self.client.block_with_transactions(number)
            })
            .await;

            match fetched {
                Ok(Some(block)) => {
                    self.process_block(&block, report).await?;
                    report.scanned_blocks += 1;
                }
                Ok(None) => {
                    warn!("Block {} not available, skipping", number);
                    report.skipped_blocks += 1;
                }
                Err(e) => {
                    warn!("Failed to fetch block {}, skipping: {}", number, e);
                    fetch_failures += 1;
                    report.skipped_blocks += 1;
                }
            }
        }

        if fetch_failures == range.block_count() {
            return Err(ScanError::ChainUnavailable {
                start: range.start,
                end: range.end,
            });
        }
        Ok(())
    }

    async fn process_block(&self, block: &ChainBlock, report: &mut ScanReport) -> Result<(), ScanError> {
        for tx in &block.transactions {
            let codes = parse_builder_codes(&tx.input);
            if codes.is_empty() {
                continue;
            }

            let Some(value) = wei_to_native(tx.value) else {
                warn!(
                    "Skipping attributed tx {:#x}: value {} wei does not fit a decimal",
                    tx.hash, tx.value
                );
                continue;
            };
            let fee_estimate = self.fee.estimate(value);

            for code in codes {
                report.attributions_found += 1;

                if self.store.register_code_if_absent(&code).await? {
                    report.codes_discovered += 1;
                    info!("Discovered builder code {} in block {}", code, block.number);
                }

                let attribution = TxAttribution {
                    tx_hash: tx.hash,
                    code,
                    timestamp: block.timestamp,
                    value,
                    fee_estimate,
                };
                if self.store.insert_attribution(&attribution).await? {
                    report.attributions_inserted += 1;
                    debug!("Recorded attribution {}", attribution.key());
                }
            }
        }
        Ok(())
    }
}
