//! Chain Client
//!
//! The scanner only needs the chain tip and full blocks. This module defines that interface,
//! implements it over an alloy provider reached by HTTP or by IPC socket, and provides the
//! exponential backoff used around every RPC call.

use alloy::network::{Ethereum, TransactionResponse};
use alloy::primitives::{Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, BlockTransactionsKind};
use alloy::transports::ipc::IpcConnect;
use alloy::transports::Transport;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

/// Default number of retries after a failed RPC call
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Initial backoff delay between retries
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay between retries
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Errors that can occur while talking to the chain
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Invalid RPC endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("Block {0} was returned without transaction bodies")]
    MissingBodies(u64),
}

/// Transaction fields the attribution pipeline reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: TxHash,
    pub input: Bytes,
    /// Value in wei
    pub value: U256,
}

/// Block with full transaction bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    /// Block timestamp in seconds
    pub timestamp: u64,
    pub transactions: Vec<ChainTransaction>,
}

/// Read access to the chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain tip
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Fetch a block with full transactions, `None` if the node does not have it
    async fn block_with_transactions(&self, number: u64) -> Result<Option<ChainBlock>, ChainError>;
}

/// Retry policy for RPC calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    /// Policy that fails on the first error
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Run `op`, retrying with exponential backoff until it succeeds or retries run out
pub async fn with_backoff<T, F, Fut>(
    retry: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retry.max_retries => {
                let delay = retry.backoff_delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label,
                    attempt + 1,
                    retry.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Where the node is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcEndpoint {
    Http(String),
    Ipc(String),
}

impl RpcEndpoint {
    /// Classify an endpoint string: `.ipc` paths are sockets, everything else is HTTP
    pub fn parse(raw: &str) -> Result<Self, ChainError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ChainError::InvalidEndpoint("endpoint cannot be empty".to_string()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(RpcEndpoint::Http(raw.to_string()));
        }
        if raw.ends_with(".ipc") {
            return Ok(RpcEndpoint::Ipc(expand_path(raw)));
        }
        Err(ChainError::InvalidEndpoint(raw.to_string()))
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// `ChainClient` over any alloy provider
pub struct RpcChainClient<P, T> {
    provider: P,
    _transport: PhantomData<fn() -> T>,
}

impl<P, T> RpcChainClient<P, T>
where
    T: Transport + Clone,
    P: Provider<T, Ethereum>,
{
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            _transport: PhantomData,
        }
    }
}

#[async_trait]
impl<P, T> ChainClient for RpcChainClient<P, T>
where
    T: Transport + Clone,
    P: Provider<T, Ethereum> + Send + Sync,
{
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<ChainBlock>, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number), BlockTransactionsKind::Full)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let Some(block) = block else {
            return Ok(None);
        };
        if !block.transactions.is_full() && !block.transactions.is_empty() {
            return Err(ChainError::MissingBodies(number));
        }

        let timestamp = block.header.timestamp;
        let transactions = block
            .transactions
            .into_transactions()
            .into_iter()
            .map(|tx| ChainTransaction {
                hash: tx.tx_hash(),
                input: alloy::consensus::Transaction::input(&tx).clone(),
                value: alloy::consensus::Transaction::value(&tx),
            })
            .collect();

        Ok(Some(ChainBlock {
            number,
            timestamp,
            transactions,
        }))
    }
}

/// Connect to the node behind `endpoint`
pub async fn connect(endpoint: &RpcEndpoint) -> Result<Arc<dyn ChainClient>, ChainError> {
    match endpoint {
        RpcEndpoint::Http(url) => {
            let url = url
                .parse()
                .map_err(|_| ChainError::InvalidEndpoint(url.clone()))?;
            info!("Using HTTP RPC endpoint {}", endpoint_label(endpoint));
            let provider = ProviderBuilder::new().on_http(url);
            Ok(Arc::new(RpcChainClient::new(provider)))
        }
        RpcEndpoint::Ipc(path) => {
            if !Path::new(path).exists() {
                return Err(ChainError::SocketNotFound(path.clone()));
            }
            info!("Connecting to IPC socket at {}", path);
            let ipc: IpcConnect<String> = IpcConnect::new(path.clone());
            let provider = ProviderBuilder::new()
                .on_ipc(ipc)
                .await
                .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;
            info!("Successfully connected to IPC socket");
            Ok(Arc::new(RpcChainClient::new(provider)))
        }
    }
}

/// Endpoint description safe to log (query strings often carry API keys)
pub fn endpoint_label(endpoint: &RpcEndpoint) -> String {
    match endpoint {
        RpcEndpoint::Http(url) => url.split('?').next().unwrap_or_default().to_string(),
        RpcEndpoint::Ipc(path) => path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    // ==================== RetryConfig tests ====================

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.initial_backoff_ms, INITIAL_BACKOFF_MS);
        assert_eq!(config.max_backoff_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let config = RetryConfig {
            max_backoff_ms: 1000,
            initial_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(10), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(20), Duration::from_millis(1000));
    }

    // ==================== with_backoff tests ====================

    #[tokio::test]
    async fn test_with_backoff_recovers_after_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_retry(3), "block_number", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::Rpc("timeout".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_retry(1), "block_number", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Rpc("down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ChainError::Rpc(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_backoff_drives_mock_client() {
        let mut client = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_block_number()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(ChainError::Rpc("503".to_string())));
        client
            .expect_block_number()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(1_000));

        let tip = with_backoff(&fast_retry(2), "block_number", || client.block_number()).await;
        assert_eq!(tip.unwrap(), 1_000);
    }

    // ==================== endpoint tests ====================

    #[test]
    fn test_endpoint_parse_http() {
        assert_eq!(
            RpcEndpoint::parse("https://mainnet.base.org").unwrap(),
            RpcEndpoint::Http("https://mainnet.base.org".to_string())
        );
    }

    #[test]
    fn test_endpoint_parse_ipc() {
        assert_eq!(
            RpcEndpoint::parse("/tmp/anvil.ipc").unwrap(),
            RpcEndpoint::Ipc("/tmp/anvil.ipc".to_string())
        );
    }

    #[test]
    fn test_endpoint_parse_expands_home() {
        match RpcEndpoint::parse("~/.foundry/anvil.ipc").unwrap() {
            RpcEndpoint::Ipc(path) => assert!(!path.starts_with("~/")),
            other => panic!("unexpected endpoint {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!(matches!(RpcEndpoint::parse(""), Err(ChainError::InvalidEndpoint(_))));
        assert!(matches!(
            RpcEndpoint::parse("ftp://node"),
            Err(ChainError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_endpoint_label_strips_query() {
        let endpoint = RpcEndpoint::Http("https://rpc.example/v2?key=secret".to_string());
        assert_eq!(endpoint_label(&endpoint), "https://rpc.example/v2");
    }

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/tmp/test.ipc"), "/tmp/test.ipc");
        assert_eq!(expand_path("/some/~path/test.ipc"), "/some/~path/test.ipc");
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_returns_error() {
        let result = connect(&RpcEndpoint::Ipc("/nonexistent/path.ipc".to_string())).await;
        assert!(matches!(result, Err(ChainError::SocketNotFound(_))));
    }
}
