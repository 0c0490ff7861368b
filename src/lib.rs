//! Builderscan Indexer Library
//!
//! This crate decodes builder-code attribution suffixes from transaction calldata,
//! scans chain block ranges for attributed transactions, and maintains per-code stats
//! and a ranked leaderboard on top of an injected storage backend.

pub mod aggregator;
pub mod chain;
pub mod config;
pub mod cursor;
pub mod fee;
pub mod leaderboard;
pub mod model;
pub mod redis_store;
pub mod scanner;
pub mod store;
pub mod suffix;

// Re-export commonly used types
pub use aggregator::StatsAggregator;
pub use chain::{ChainBlock, ChainClient, ChainTransaction};
pub use config::IndexerConfig;
pub use cursor::{IndexerCursor, ScanWindow};
pub use fee::{FeeEstimator, ProportionalFee};
pub use leaderboard::{CodeSummary, LeaderboardEntry};
pub use model::{BuilderCode, CodeStats, TxAttribution};
pub use redis_store::RedisStore;
pub use scanner::{ChainScanner, ScanReport};
pub use store::{AttributionStore, MemoryStore};
pub use suffix::{append_suffix, parse_builder_codes};
