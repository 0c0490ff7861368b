//! Indexer Cursor
//!
//! Persisted resume point of the scanner. The cursor moves through
//! `Uninitialized → Scanning → Idle → Scanning → …` and is only written when a batch
//! commits, with a compare-and-swap against the value read at load time.

use thiserror::Error;
use tracing::{debug, info};

use crate::store::{AttributionStore, StoreError};

/// Base produces a block every 2 seconds
pub const DEFAULT_BLOCKS_PER_DAY: u64 = 43_200;

/// Days scanned back from the tip on a first run
pub const DEFAULT_DAYS_BACK: u64 = 1;

/// Upper bound on blocks handled by one invocation
pub const DEFAULT_MAX_BLOCKS_PER_RUN: u64 = 2_000;

/// Errors that can occur while loading or committing the cursor
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cursor moved concurrently (expected {expected:?}, tried to write {attempted})")]
    Conflict { expected: Option<u64>, attempted: u64 },

    #[error("Invalid cursor transition: {0}")]
    InvalidTransition(&'static str),
}

/// Inclusive range of block heights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn block_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn blocks(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

/// How far a scan reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub blocks_per_day: u64,
    pub days_back: u64,
    /// Start height used instead of the lookback when no cursor exists
    pub start_block: Option<u64>,
    pub max_blocks_per_run: u64,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self {
            blocks_per_day: DEFAULT_BLOCKS_PER_DAY,
            days_back: DEFAULT_DAYS_BACK,
            start_block: None,
            max_blocks_per_run: DEFAULT_MAX_BLOCKS_PER_RUN,
        }
    }
}

impl ScanWindow {
    /// Blocks scanned back from the tip on a first run
    pub fn lookback(&self) -> u64 {
        self.blocks_per_day.saturating_mul(self.days_back)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No batch has ever committed
    Uninitialized,
    /// A batch over `range` is in flight
    Scanning { range: BlockRange },
    /// Last committed batch ended at `last_block`
    Idle { last_block: u64 },
}

/// Resume point of the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerCursor {
    observed: Option<u64>,
    state: CursorState,
}

impl IndexerCursor {
    /// Build a cursor from a persisted value
    pub fn from_last_block(last_block: Option<u64>) -> Self {
        let state = match last_block {
            Some(last_block) => CursorState::Idle { last_block },
            None => CursorState::Uninitialized,
        };
        Self {
            observed: last_block,
            state,
        }
    }

    /// Read the persisted cursor
    pub async fn load(store: &dyn AttributionStore) -> Result<Self, CursorError> {
        let last_block = store.load_cursor().await?;
        debug!("Loaded indexer cursor {:?}", last_block);
        Ok(Self::from_last_block(last_block))
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Last committed block, as read at load time or written by the last commit
    pub fn last_block(&self) -> Option<u64> {
        self.observed
    }

    /// Plan the next batch against the current tip
    ///
    /// # Returns
    /// `None` when the cursor has already reached the tip
    pub fn plan(&self, tip: u64, window: &ScanWindow) -> Option<BlockRange> {
        let start = match self.observed {
            Some(last_block) => last_block.checked_add(1)?,
            None => window
                .start_block
                .unwrap_or_else(|| tip.saturating_sub(window.lookback())),
        };
        if start > tip {
            return None;
        }

        let span = window.max_blocks_per_run.max(1) - 1;
        let end = tip.min(start.saturating_add(span));
        Some(BlockRange { start, end })
    }

    /// Enter `Scanning` for `range`
    pub fn begin(&mut self, range: BlockRange) -> Result<(), CursorError> {
        if let CursorState::Scanning { .. } = self.state {
            return Err(CursorError::InvalidTransition("batch already in flight"));
        }
        if range.start > range.end {
            return Err(CursorError::InvalidTransition("empty block range"));
        }
        self.state = CursorState::Scanning { range };
        Ok(())
    }

    /// Drop an in-flight batch without persisting anything
    pub fn abandon(&mut self) {
        if let CursorState::Scanning { .. } = self.state {
            *self = Self::from_last_block(self.observed);
        }
    }

    /// Persist the end of the in-flight batch and return to `Idle`
    ///
    /// Fails with `Conflict` if the stored cursor no longer matches the value this cursor
    /// was loaded with.
    pub async fn commit(&mut self, store: &dyn AttributionStore) -> Result<u64, CursorError> {
        let CursorState::Scanning { range } = self.state else {
            return Err(CursorError::InvalidTransition("no batch in flight"));
        };

        let swapped = store.compare_and_swap_cursor(self.observed, range.end).await?;
        if !swapped {
            return Err(CursorError::Conflict {
                expected: self.observed,
                attempted: range.end,
            });
        }

        info!("Committed indexer cursor at block {}", range.end);
        self.observed = Some(range.end);
        self.state = CursorState::Idle {
            last_block: range.end,
        };
        Ok(range.end)
    }
}
