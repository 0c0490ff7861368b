//! Stats Aggregator
//!
//! Rebuilds `CodeStats` from the full attribution set on every pass. Nothing is
//! incremented in place, so repeated or reordered passes converge to the same rows.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::model::{current_timestamp_millis, CodeStats};
use crate::store::{AttributionStore, AttributionsByCode, StoreError};

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decimal overflow while summing {field} for code {code}")]
    Overflow { code: String, field: &'static str },
}

/// Sum grouped attributions into one stats row per code
///
/// # Arguments
/// * `grouped` - Attributions grouped by code
/// * `now` - Timestamp stamped on every row, in milliseconds
pub fn aggregate(grouped: &AttributionsByCode, now: u64) -> Result<Vec<CodeStats>, AggregateError> {
    let mut stats = Vec::with_capacity(grouped.len());

    for (code, rows) in grouped {
        if rows.is_empty() {
            continue;
        }

        let mut volume = Decimal::ZERO;
        let mut fee_estimate = Decimal::ZERO;
        for row in rows {
            volume = volume.checked_add(row.value).ok_or_else(|| AggregateError::Overflow {
                code: code.clone(),
                field: "volume",
            })?;
            fee_estimate = fee_estimate.checked_add(row.fee_estimate).ok_or_else(|| {
                AggregateError::Overflow {
                    code: code.clone(),
                    field: "fee_estimate",
                }
            })?;
        }

        stats.push(CodeStats {
            code: code.clone(),
            tx_count: rows.len() as u64,
            volume: volume.normalize(),
            fee_estimate: fee_estimate.normalize(),
            updated_at: now,
        });
    }

    Ok(stats)
}

/// Recomputes per-code totals from the attribution store
pub struct StatsAggregator {
    store: Arc<dyn AttributionStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn AttributionStore>) -> Self {
        Self { store }
    }

    /// Run one full aggregation pass
    ///
    /// Stats are written in a single store call; on any error nothing is written and the
    /// next pass starts over.
    pub async fn recompute(&self) -> Result<Vec<CodeStats>, AggregateError> {
        let grouped = self.store.list_attributions_by_code().await?;
        let stats = aggregate(&grouped, current_timestamp_millis())?;
        self.store.upsert_code_stats(&stats).await?;
        info!("Aggregated stats for {} codes", stats.len());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TxAttribution;
    use crate::store::{group_by_code, MemoryStore};
    use alloy::primitives::TxHash;
    use std::str::FromStr;

    fn row(hash_byte: u8, code: &str, value: &str, fee: &str) -> TxAttribution {
        TxAttribution {
            tx_hash: TxHash::repeat_byte(hash_byte),
            code: code.to_string(),
            timestamp: 0,
            value: Decimal::from_str(value).unwrap(),
            fee_estimate: Decimal::from_str(fee).unwrap(),
        }
    }

    #[test]
    fn test_aggregate_is_exact() {
        let grouped = group_by_code(vec![
            row(1, "x", "1.1", "0.00055"),
            row(2, "x", "2.2", "0.0011"),
            row(3, "x", "3.3", "0.00165"),
        ]);
        let stats = aggregate(&grouped, 7).unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tx_count, 3);
        assert_eq!(stats[0].volume.to_string(), "6.6");
        assert_eq!(stats[0].fee_estimate.to_string(), "0.0033");
        assert_eq!(stats[0].updated_at, 7);
    }

    #[test]
    fn test_aggregate_many_small_values_do_not_drift() {
        let rows = (0..1000u32)
            .map(|i| TxAttribution {
                tx_hash: TxHash::left_padding_from(&i.to_be_bytes()),
                code: "dust".to_string(),
                timestamp: 0,
                value: Decimal::from_str("0.1").unwrap(),
                fee_estimate: Decimal::from_str("0.00005").unwrap(),
            })
            .collect::<Vec<_>>();
        let stats = aggregate(&group_by_code(rows), 0).unwrap();

        assert_eq!(stats[0].volume, Decimal::from(100));
        assert_eq!(stats[0].fee_estimate.to_string(), "0.05");
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let forward = vec![row(1, "a", "0.3", "0"), row(2, "a", "0.7", "0"), row(3, "b", "1", "0")];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(
            aggregate(&group_by_code(forward), 0).unwrap(),
            aggregate(&group_by_code(backward), 0).unwrap()
        );
    }

    #[test]
    fn test_aggregate_overflow_is_an_error() {
        let grouped = group_by_code(vec![
            TxAttribution {
                value: Decimal::MAX,
                ..row(1, "whale", "0", "0")
            },
            TxAttribution {
                value: Decimal::MAX,
                ..row(2, "whale", "0", "0")
            },
        ]);
        assert!(matches!(
            aggregate(&grouped, 0),
            Err(AggregateError::Overflow { field: "volume", .. })
        ));
    }

    #[tokio::test]
    async fn test_recompute_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attribution(&row(1, "x", "1", "0.0005")).await.unwrap();
        store.insert_attribution(&row(1, "x", "1", "0.0005")).await.unwrap();
        store.insert_attribution(&row(1, "y", "1", "0.0005")).await.unwrap();

        let aggregator = StatsAggregator::new(store.clone());
        aggregator.recompute().await.unwrap();
        aggregator.recompute().await.unwrap();

        let x = store.code_stats("x").await.unwrap().unwrap();
        assert_eq!(x.tx_count, 1);
        assert_eq!(x.volume, Decimal::ONE);
        assert_eq!(store.list_code_stats().await.unwrap().len(), 2);
    }
}
