//! Attribution Store
//!
//! Storage interface injected into the scanner, the aggregator and the leaderboard, plus an
//! in-process implementation that can persist itself to a JSON snapshot file.
//!
//! The snapshot is written only when the cursor, stats, a registration or likes change.
//! Discovered codes and attributions stay in memory until the next cursor commit; the cursor
//! is never on disk ahead of the attributions it covers, so a crash only costs a re-scan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::model::{
    current_timestamp_millis, AttributionKey, BuilderCode, CodeRegistration, CodeStats,
    TxAttribution,
};

/// Attributions grouped by code, each group in insertion-independent order
pub type AttributionsByCode = BTreeMap<String, Vec<TxAttribution>>;

/// Errors that can occur while reading or writing the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown builder code: {0}")]
    UnknownCode(String),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Durable record of codes, attributions, stats, likes and the scan cursor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttributionStore: Send + Sync {
    /// Create an unregistered row for `code` unless one exists
    ///
    /// Returns `true` if a row was created.
    async fn register_code_if_absent(&self, code: &str) -> Result<bool, StoreError>;

    /// Create or update a code's registration details
    async fn upsert_builder_code(
        &self,
        registration: CodeRegistration,
    ) -> Result<BuilderCode, StoreError>;

    async fn builder_code(&self, code: &str) -> Result<Option<BuilderCode>, StoreError>;

    /// Rows for every known code among `codes`, in one read
    async fn builder_codes_for(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, BuilderCode>, StoreError>;

    /// Insert an attribution keyed by `(tx_hash, code)`
    ///
    /// Returns `false` without error if the key already exists.
    async fn insert_attribution(&self, attribution: &TxAttribution) -> Result<bool, StoreError>;

    async fn list_attributions_by_code(&self) -> Result<AttributionsByCode, StoreError>;

    /// Upsert every row of `stats` as one atomic write
    async fn upsert_code_stats(&self, stats: &[CodeStats]) -> Result<(), StoreError>;

    async fn code_stats(&self, code: &str) -> Result<Option<CodeStats>, StoreError>;

    async fn list_code_stats(&self) -> Result<Vec<CodeStats>, StoreError>;

    /// Add `delta` (clamped to -1..=1) to a code's likes, never going below zero
    async fn increment_likes(&self, code: &str, delta: i64) -> Result<u64, StoreError>;

    async fn likes(&self, code: &str) -> Result<u64, StoreError>;

    /// Likes of every code in `codes`, zero where none were recorded, in one read
    async fn likes_for(&self, codes: &[String]) -> Result<HashMap<String, u64>, StoreError>;

    /// Last fully scanned block, if any scan ever committed
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError>;

    /// Set the cursor to `next` only if it still equals `expected`
    ///
    /// Returns `false` if another writer moved the cursor first.
    async fn compare_and_swap_cursor(
        &self,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, StoreError>;
}

/// Clamp a like delta to a single step
pub fn clamp_like_delta(delta: i64) -> i64 {
    delta.clamp(-1, 1)
}

/// Apply a clamped like delta to a current total
pub fn apply_like_delta(current: u64, delta: i64) -> u64 {
    match clamp_like_delta(delta) {
        1 => current.saturating_add(1),
        -1 => current.saturating_sub(1),
        _ => current,
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    builder_codes: BTreeMap<String, BuilderCode>,
    code_stats: BTreeMap<String, CodeStats>,
    tx_attributions: HashMap<String, TxAttribution>,
    code_likes: BTreeMap<String, u64>,
    indexer_cursor: Option<u64>,
}

/// In-process store, optionally mirrored to a JSON snapshot at commit points
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot_path: Option<PathBuf>,
    snapshot_writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store that lives only in memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed store, loading the snapshot if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Tables::default()
        };
        debug!("Opened snapshot store at {}", path.display());

        Ok(Self {
            tables: Mutex::new(tables),
            snapshot_path: Some(path),
            snapshot_writes: AtomicU64::new(0),
        })
    }

    /// Path of the backing snapshot, if any
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Snapshot files written since the store was opened
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::Relaxed)
    }

    /// Number of stored attributions
    pub fn attribution_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.tx_attributions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(tables)?;
        // Write then rename so a crash never leaves a half-written snapshot
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        self.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persist `tables`, undoing the in-memory change with `rollback` if the write fails
    fn persist_or_rollback<F>(&self, tables: &mut Tables, rollback: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tables),
    {
        if let Err(e) = self.persist(tables) {
            rollback(tables);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl AttributionStore for MemoryStore {
    async fn register_code_if_absent(&self, code: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        if tables.builder_codes.contains_key(code) {
            return Ok(false);
        }
        tables.builder_codes.insert(
            code.to_string(),
            BuilderCode::discovered(code, current_timestamp_millis()),
        );
        Ok(true)
    }

    async fn upsert_builder_code(
        &self,
        registration: CodeRegistration,
    ) -> Result<BuilderCode, StoreError> {
        let mut tables = self.lock()?;
        let existing = tables.builder_codes.get(&registration.code).cloned();
        let row = registration.apply(existing.as_ref(), current_timestamp_millis());
        tables.builder_codes.insert(row.code.clone(), row.clone());
        self.persist_or_rollback(&mut tables, |tables| match existing {
            Some(previous) => {
                tables.builder_codes.insert(previous.code.clone(), previous);
            }
            None => {
                tables.builder_codes.remove(&row.code);
            }
        })?;
        Ok(row)
    }

    async fn builder_code(&self, code: &str) -> Result<Option<BuilderCode>, StoreError> {
        Ok(self.lock()?.builder_codes.get(code).cloned())
    }

    async fn builder_codes_for(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, BuilderCode>, StoreError> {
        let tables = self.lock()?;
        Ok(codes
            .iter()
            .filter_map(|code| {
                tables
                    .builder_codes
                    .get(code)
                    .map(|row| (code.clone(), row.clone()))
            })
            .collect())
    }

    async fn insert_attribution(&self, attribution: &TxAttribution) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let key = attribution.key().to_string();
        if tables.tx_attributions.contains_key(&key) {
            return Ok(false);
        }
        tables.tx_attributions.insert(key, attribution.clone());
        Ok(true)
    }

    async fn list_attributions_by_code(&self) -> Result<AttributionsByCode, StoreError> {
        let tables = self.lock()?;
        Ok(group_by_code(tables.tx_attributions.values().cloned()))
    }

    async fn upsert_code_stats(&self, stats: &[CodeStats]) -> Result<(), StoreError> {
        if stats.is_empty() {
            return Ok(());
        }

        let mut tables = self.lock()?;
        let mut next = tables.code_stats.clone();
        for row in stats {
            next.insert(row.code.clone(), row.clone());
        }
        let previous = std::mem::replace(&mut tables.code_stats, next);
        self.persist_or_rollback(&mut tables, |tables| tables.code_stats = previous)
    }

    async fn code_stats(&self, code: &str) -> Result<Option<CodeStats>, StoreError> {
        Ok(self.lock()?.code_stats.get(code).cloned())
    }

    async fn list_code_stats(&self) -> Result<Vec<CodeStats>, StoreError> {
        Ok(self.lock()?.code_stats.values().cloned().collect())
    }

    async fn increment_likes(&self, code: &str, delta: i64) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        if !tables.builder_codes.contains_key(code) {
            return Err(StoreError::UnknownCode(code.to_string()));
        }
        let previous = tables.code_likes.get(code).copied();
        let likes = apply_like_delta(previous.unwrap_or(0), delta);
        tables.code_likes.insert(code.to_string(), likes);
        self.persist_or_rollback(&mut tables, |tables| match previous {
            Some(previous) => {
                tables.code_likes.insert(code.to_string(), previous);
            }
            None => {
                tables.code_likes.remove(code);
            }
        })?;
        Ok(likes)
    }

    async fn likes(&self, code: &str) -> Result<u64, StoreError> {
        Ok(self.lock()?.code_likes.get(code).copied().unwrap_or(0))
    }

    async fn likes_for(&self, codes: &[String]) -> Result<HashMap<String, u64>, StoreError> {
        let tables = self.lock()?;
        Ok(codes
            .iter()
            .map(|code| {
                let likes = tables.code_likes.get(code).copied().unwrap_or(0);
                (code.clone(), likes)
            })
            .collect())
    }

    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.indexer_cursor)
    }

    async fn compare_and_swap_cursor(
        &self,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        if tables.indexer_cursor != expected {
            return Ok(false);
        }
        tables.indexer_cursor = Some(next);
        self.persist_or_rollback(&mut tables, |tables| tables.indexer_cursor = expected)?;
        Ok(true)
    }
}

/// Group attributions by code with a stable order inside each group
pub fn group_by_code(attributions: impl IntoIterator<Item = TxAttribution>) -> AttributionsByCode {
    let mut grouped = AttributionsByCode::new();
    for attribution in attributions {
        grouped
            .entry(attribution.code.clone())
            .or_default()
            .push(attribution);
    }
    for rows in grouped.values_mut() {
        rows.sort_by_key(|row| row.key());
    }
    grouped
}

/// Parse a key produced by `AttributionKey`'s `Display` impl
pub fn parse_attribution_key(raw: &str) -> Option<AttributionKey> {
    let (hash, code) = raw.split_once(':')?;
    Some(AttributionKey {
        tx_hash: hash.parse().ok()?,
        code: code.to_string(),
    })
}
