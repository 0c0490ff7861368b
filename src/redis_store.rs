//! Redis Attribution Store
//!
//! Durable `AttributionStore` on Redis. Records are JSON values inside one hash per table:
//!
//! - `{prefix}:builder_codes`   code → `BuilderCode`
//! - `{prefix}:tx_attributions` `{tx_hash}:{code}` → `TxAttribution`
//! - `{prefix}:code_stats`      code → `CodeStats`
//! - `{prefix}:code_likes`      code → integer
//! - `{prefix}:indexer_cursor`  last scanned block
//!
//! Insert-if-absent maps to `HSETNX`, stats are written in one `MULTI` pipeline, and the
//! cursor and likes are updated by Lua scripts so concurrent invocations cannot lose updates.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::info;

use crate::model::{
    current_timestamp_millis, BuilderCode, CodeRegistration, CodeStats, TxAttribution,
};
use crate::store::{clamp_like_delta, group_by_code, AttributionStore, AttributionsByCode, StoreError};

/// Default key namespace
pub const DEFAULT_KEY_PREFIX: &str = "builderscan";

const CAS_CURSOR_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const INCREMENT_LIKES_SCRIPT: &str = r#"
local likes = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0') + tonumber(ARGV[2])
if likes < 0 then
    likes = 0
end
redis.call('HSET', KEYS[1], ARGV[1], likes)
return likes
"#;

/// Key names of every table under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    pub builder_codes: String,
    pub tx_attributions: String,
    pub code_stats: String,
    pub code_likes: String,
    pub indexer_cursor: String,
}

impl RedisKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            builder_codes: format!("{prefix}:builder_codes"),
            tx_attributions: format!("{prefix}:tx_attributions"),
            code_stats: format!("{prefix}:code_stats"),
            code_likes: format!("{prefix}:code_likes"),
            indexer_cursor: format!("{prefix}:indexer_cursor"),
        }
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Redis-backed attribution store
pub struct RedisStore {
    connection: MultiplexedConnection,
    keys: RedisKeys,
    cas_cursor: Script,
    increment_likes: Script,
}

impl RedisStore {
    /// Create a store over an established multiplexed connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `prefix` - Namespace prepended to every key
    pub fn new(connection: MultiplexedConnection, prefix: &str) -> Self {
        Self {
            connection,
            keys: RedisKeys::new(prefix),
            cas_cursor: Script::new(CAS_CURSOR_SCRIPT),
            increment_likes: Script::new(INCREMENT_LIKES_SCRIPT),
        }
    }

    /// Open a connection to `url` and create a store on it
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis store (prefix {})", prefix);
        Ok(Self::new(connection, prefix))
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    // The multiplexed connection is a cheap handle; each call gets its own.
    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl AttributionStore for RedisStore {
    async fn register_code_if_absent(&self, code: &str) -> Result<bool, StoreError> {
        let row = BuilderCode::discovered(code, current_timestamp_millis());
        let json = serde_json::to_string(&row)?;
        let created: bool = self
            .conn()
            .hset_nx(&self.keys.builder_codes, code, json)
            .await?;
        Ok(created)
    }

    async fn upsert_builder_code(
        &self,
        registration: CodeRegistration,
    ) -> Result<BuilderCode, StoreError> {
        let existing = self.builder_code(&registration.code).await?;
        let row = registration.apply(existing.as_ref(), current_timestamp_millis());
        let json = serde_json::to_string(&row)?;
        let _: () = self
            .conn()
            .hset(&self.keys.builder_codes, &row.code, json)
            .await?;
        Ok(row)
    }

    async fn builder_code(&self, code: &str) -> Result<Option<BuilderCode>, StoreError> {
        let raw: Option<String> = self.conn().hget(&self.keys.builder_codes, code).await?;
        raw.map(|raw| decode(&self.keys.builder_codes, &raw))
            .transpose()
    }

    async fn builder_codes_for(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, BuilderCode>, StoreError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.builder_codes)
            .arg(codes)
            .query_async(&mut self.conn())
            .await?;
        let mut rows = HashMap::with_capacity(codes.len());
        for (code, raw) in codes.iter().zip(raw) {
            if let Some(raw) = raw {
                rows.insert(code.clone(), decode(&self.keys.builder_codes, &raw)?);
            }
        }
        Ok(rows)
    }

    async fn insert_attribution(&self, attribution: &TxAttribution) -> Result<bool, StoreError> {
        let field = attribution.key().to_string();
        let json = serde_json::to_string(attribution)?;
        let inserted: bool = self
            .conn()
            .hset_nx(&self.keys.tx_attributions, field, json)
            .await?;
        Ok(inserted)
    }

    async fn list_attributions_by_code(&self) -> Result<AttributionsByCode, StoreError> {
        let raw: Vec<String> = self.conn().hvals(&self.keys.tx_attributions).await?;
        let rows = raw
            .iter()
            .map(|raw| decode::<TxAttribution>(&self.keys.tx_attributions, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(group_by_code(rows))
    }

    async fn upsert_code_stats(&self, stats: &[CodeStats]) -> Result<(), StoreError> {
        if stats.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for row in stats {
            pipe.hset(&self.keys.code_stats, &row.code, serde_json::to_string(row)?)
                .ignore();
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn code_stats(&self, code: &str) -> Result<Option<CodeStats>, StoreError> {
        let raw: Option<String> = self.conn().hget(&self.keys.code_stats, code).await?;
        raw.map(|raw| decode(&self.keys.code_stats, &raw)).transpose()
    }

    async fn list_code_stats(&self) -> Result<Vec<CodeStats>, StoreError> {
        let raw: Vec<String> = self.conn().hvals(&self.keys.code_stats).await?;
        raw.iter()
            .map(|raw| decode(&self.keys.code_stats, raw))
            .collect()
    }

    async fn increment_likes(&self, code: &str, delta: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let known: bool = conn.hexists(&self.keys.builder_codes, code).await?;
        if !known {
            return Err(StoreError::UnknownCode(code.to_string()));
        }

        let likes: u64 = self
            .increment_likes
            .key(&self.keys.code_likes)
            .arg(code)
            .arg(clamp_like_delta(delta))
            .invoke_async(&mut conn)
            .await?;
        Ok(likes)
    }

    async fn likes(&self, code: &str) -> Result<u64, StoreError> {
        let likes: Option<u64> = self.conn().hget(&self.keys.code_likes, code).await?;
        Ok(likes.unwrap_or(0))
    }

    async fn likes_for(&self, codes: &[String]) -> Result<HashMap<String, u64>, StoreError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }

        let likes: Vec<Option<u64>> = redis::cmd("HMGET")
            .arg(&self.keys.code_likes)
            .arg(codes)
            .query_async(&mut self.conn())
            .await?;
        Ok(codes
            .iter()
            .cloned()
            .zip(likes.into_iter().map(|likes| likes.unwrap_or(0)))
            .collect())
    }

    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        let cursor: Option<u64> = self.conn().get(&self.keys.indexer_cursor).await?;
        Ok(cursor)
    }

    async fn compare_and_swap_cursor(
        &self,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, StoreError> {
        let expected = expected.map(|block| block.to_string()).unwrap_or_default();
        let swapped: bool = self
            .cas_cursor
            .key(&self.keys.indexer_cursor)
            .arg(expected)
            .arg(next)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(swapped)
    }
}
