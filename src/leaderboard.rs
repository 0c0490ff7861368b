//! Leaderboard
//!
//! Read-only projections over `CodeStats`, `BuilderCode` and likes: the ranked list and the
//! single-code lookup. Ranking is fee estimate descending, then volume descending, then code
//! ascending, so pages are stable between calls.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::model::CodeStats;
use crate::store::{AttributionStore, StoreError};

/// Rows returned when the caller gives no limit
pub const DEFAULT_LIMIT: usize = 50;

/// One ranked row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub code: String,
    pub tx_count: u64,
    pub volume: Decimal,
    pub fee_estimate: Decimal,
    pub likes: u64,
    pub owner_address: Address,
    pub app_url: Option<String>,
}

/// Single-code view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSummary {
    pub code: String,
    pub owner_address: Address,
    pub app_url: Option<String>,
    pub metadata: Option<String>,
    pub created_at: u64,
    /// Absent until the code has at least one aggregated attribution
    pub stats: Option<CodeStats>,
    pub likes: u64,
}

/// Leaderboard ordering
pub fn compare(a: &CodeStats, b: &CodeStats) -> Ordering {
    b.fee_estimate
        .cmp(&a.fee_estimate)
        .then_with(|| b.volume.cmp(&a.volume))
        .then_with(|| a.code.cmp(&b.code))
}

/// Filter and order stats rows
///
/// # Arguments
/// * `stats` - Every stats row in the store
/// * `is_known` - Whether a `BuilderCode` row exists for a code
///
/// # Returns
/// Rows with `tx_count > 0` and a known code, in leaderboard order
pub fn rank<F>(stats: Vec<CodeStats>, is_known: F) -> Vec<CodeStats>
where
    F: Fn(&str) -> bool,
{
    let mut eligible: Vec<CodeStats> = stats
        .into_iter()
        .filter(|row| row.tx_count > 0 && is_known(&row.code))
        .collect();
    eligible.sort_by(compare);
    eligible
}

/// Top `limit` codes by fee estimate
pub async fn top(
    store: &dyn AttributionStore,
    limit: usize,
) -> Result<Vec<LeaderboardEntry>, StoreError> {
    let stats = store.list_code_stats().await?;
    let stat_codes: Vec<String> = stats.iter().map(|row| row.code.clone()).collect();
    let mut codes = store.builder_codes_for(&stat_codes).await?;

    let ranked: Vec<CodeStats> = rank(stats, |code| codes.contains_key(code))
        .into_iter()
        .take(limit)
        .collect();
    let ranked_codes: Vec<String> = ranked.iter().map(|row| row.code.clone()).collect();
    let likes = store.likes_for(&ranked_codes).await?;

    let mut entries = Vec::with_capacity(ranked.len());
    for (index, row) in ranked.into_iter().enumerate() {
        let (owner_address, app_url) = codes
            .remove(&row.code)
            .map(|builder_code| (builder_code.owner_address, builder_code.app_url))
            .unwrap_or_default();

        entries.push(LeaderboardEntry {
            rank: index + 1,
            likes: likes.get(&row.code).copied().unwrap_or(0),
            code: row.code,
            tx_count: row.tx_count,
            volume: row.volume,
            fee_estimate: row.fee_estimate,
            owner_address,
            app_url,
        });
    }

    Ok(entries)
}

/// Look up one code, `None` if it was never registered or discovered
pub async fn lookup(
    store: &dyn AttributionStore,
    code: &str,
) -> Result<Option<CodeSummary>, StoreError> {
    let Some(builder_code) = store.builder_code(code).await? else {
        return Ok(None);
    };
    let stats = store.code_stats(code).await?;
    let likes = store.likes(code).await?;

    Ok(Some(CodeSummary {
        code: builder_code.code,
        owner_address: builder_code.owner_address,
        app_url: builder_code.app_url,
        metadata: builder_code.metadata,
        created_at: builder_code.created_at,
        stats,
        likes,
    }))
}
