//! Persisted Records
//!
//! Record shapes shared by the stores, the scanner and the aggregator.
//! Monetary amounts are `Decimal` end to end; they are never accumulated in floating point.

use alloy::primitives::{Address, TxHash, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Owner placeholder for codes discovered in calldata before any registration
pub const UNREGISTERED_OWNER: Address = Address::ZERO;

/// Decimal places of the native currency (wei per ether)
pub const NATIVE_DECIMALS: u32 = 18;

/// A builder code and its registration details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderCode {
    pub code: String,
    pub owner_address: Address,
    pub app_url: Option<String>,
    /// Opaque metadata blob, JSON in practice
    pub metadata: Option<String>,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    /// Unix timestamp in milliseconds
    pub updated_at: u64,
}

impl BuilderCode {
    /// Row created when a code is first seen in calldata
    pub fn discovered(code: impl Into<String>, now: u64) -> Self {
        let code = code.into();
        let metadata = serde_json::json!({
            "name": code,
            "description": "Auto-discovered code",
        })
        .to_string();

        Self {
            code,
            owner_address: UNREGISTERED_OWNER,
            app_url: None,
            metadata: Some(metadata),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.owner_address != UNREGISTERED_OWNER
    }
}

/// Registration or update of a code's owner details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRegistration {
    pub code: String,
    pub owner_address: Address,
    pub app_url: Option<String>,
    pub metadata: Option<String>,
}

impl CodeRegistration {
    /// Apply this registration on top of an existing row (if any)
    pub fn apply(self, existing: Option<&BuilderCode>, now: u64) -> BuilderCode {
        BuilderCode {
            created_at: existing.map(|row| row.created_at).unwrap_or(now),
            updated_at: now,
            code: self.code,
            owner_address: self.owner_address,
            app_url: self.app_url,
            metadata: self.metadata,
        }
    }
}

/// One transaction attributed to one code
///
/// Unique on `(tx_hash, code)`: a transaction carrying several codes yields several rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAttribution {
    pub tx_hash: TxHash,
    pub code: String,
    /// Block timestamp in seconds
    pub timestamp: u64,
    /// Native-currency amount transferred
    pub value: Decimal,
    pub fee_estimate: Decimal,
}

impl TxAttribution {
    /// Composite key used for deduplication
    pub fn key(&self) -> AttributionKey {
        AttributionKey {
            tx_hash: self.tx_hash,
            code: self.code.clone(),
        }
    }
}

/// Composite `(tx_hash, code)` key of an attribution
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributionKey {
    pub tx_hash: TxHash,
    pub code: String,
}

impl std::fmt::Display for AttributionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Hashes are fixed width so the first ':' always ends the hash
        write!(f, "{:#x}:{}", self.tx_hash, self.code)
    }
}

/// Aggregated totals for one code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeStats {
    pub code: String,
    pub tx_count: u64,
    pub volume: Decimal,
    pub fee_estimate: Decimal,
    /// Unix timestamp in milliseconds
    pub updated_at: u64,
}

/// Convert a wei amount to native-currency units without rounding
///
/// Returns `None` if the amount does not fit `Decimal`'s 96-bit mantissa
/// (roughly 79 billion ether).
pub fn wei_to_native(value: U256) -> Option<Decimal> {
    let wei = i128::try_from(value).ok()?;
    Decimal::try_from_i128_with_scale(wei, NATIVE_DECIMALS)
        .ok()
        .map(|amount| amount.normalize())
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
