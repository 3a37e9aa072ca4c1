//! Chain provider with multi-RPC support and automatic failover

use super::{ChainClient, NonceTag};
use crate::config::Settings;
use crate::error::{OpsError, OpsResult};
use crate::tx::FeeQuote;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Arc<Provider<Http>>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a provider over every configured RPC URL
    pub fn new(settings: &Settings) -> OpsResult<Self> {
        let mut http_providers = Vec::new();

        for url in settings.rpc_urls() {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(
                        settings.chain.receipt_poll_interval_ms,
                    ));
                    http_providers.push(Arc::new(provider));
                    debug!("Added HTTP provider for chain {}: {}", settings.chain.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(OpsError::config("chain.rpc_urls", "no valid RPC providers"));
        }

        Ok(Self {
            chain_id: settings.chain.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> Arc<Provider<Http>> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        self.http_providers[idx % self.http_providers.len()].clone()
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a read against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, operation: &str, op: F) -> OpsResult<T>
    where
        F: Fn(Arc<Provider<Http>>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::from("no providers");

        for _ in 0..self.http_providers.len() {
            match op(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed on chain {}: {}", operation, self.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(OpsError::Chain(format!(
            "{}: all providers failed, last error: {}",
            operation, last_error
        )))
    }
}

/// `2 * base + tip` when both are known, `2 * base` when only the block's
/// base fee is
pub fn suggested_max_fee(base_fee: Option<U256>, priority_fee: Option<U256>) -> Option<U256> {
    let doubled = base_fee?.saturating_mul(U256::from(2u64));
    Some(match priority_fee {
        Some(tip) => doubled.saturating_add(tip),
        None => doubled,
    })
}

/// Node rejections stay `Broadcast`; anything that never got a JSON-RPC
/// answer is a transport failure
fn send_error(e: ProviderError) -> OpsError {
    match &e {
        ProviderError::JsonRpcClientError(inner) if inner.as_error_response().is_some() => {
            OpsError::Broadcast(e.to_string())
        }
        ProviderError::JsonRpcClientError(_) | ProviderError::HTTPError(_) => {
            OpsError::Chain(e.to_string())
        }
        _ => OpsError::Broadcast(e.to_string()),
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn fee_quote(&self) -> OpsResult<FeeQuote> {
        let block = self
            .with_failover("get_block", move |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?;
        let base_fee = block.and_then(|b| b.base_fee_per_gas);

        // Not every node serves this method; absence is part of the quote.
        let suggested_priority_fee = match self
            .http()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(tip) => Some(tip),
            Err(e) => {
                debug!("eth_maxPriorityFeePerGas unavailable: {}", e);
                None
            }
        };

        Ok(FeeQuote {
            base_fee,
            suggested_priority_fee,
            suggested_max_fee: suggested_max_fee(base_fee, suggested_priority_fee),
        })
    }

    async fn nonce(&self, account: Address, tag: NonceTag) -> OpsResult<u64> {
        let block = BlockId::Number(tag.into());
        self.with_failover("get_transaction_count", move |p| async move {
            p.get_transaction_count(account, Some(block)).await
        })
        .await
        .map(|n| n.as_u64())
    }

    async fn native_balance(&self, account: Address) -> OpsResult<U256> {
        self.with_failover("get_balance", move |p| async move {
            p.get_balance(account, None).await
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes) -> OpsResult<Bytes> {
        let tx: TypedTransaction = Eip1559TransactionRequest::new().to(to).data(data).into();
        self.with_failover("eth_call", move |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> OpsResult<H256> {
        let provider = self.http();
        let result = match provider.send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let err = send_error(e);
                if err.is_retryable() {
                    self.failover();
                }
                Err(err)
            }
        };
        result
    }

    async fn transaction(&self, hash: H256) -> OpsResult<Option<Transaction>> {
        self.with_failover("get_transaction", move |p| async move {
            p.get_transaction(hash).await
        })
        .await
    }

    async fn transaction_receipt(&self, hash: H256) -> OpsResult<Option<TransactionReceipt>> {
        self.with_failover("get_transaction_receipt", move |p| async move {
            p.get_transaction_receipt(hash).await
        })
        .await
    }

    async fn revert_reason(&self, hash: H256) -> Option<String> {
        let provider = self.http();
        let tx = provider.get_transaction(hash).await.ok()??;
        let block = tx.block_number?;

        // Replaying the call at the inclusion block surfaces the revert data.
        let typed: TypedTransaction = (&tx).into();
        match provider.call(&typed, Some(BlockId::Number(block.into()))).await {
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{HttpClientError, JsonRpcError};

    fn gwei_u(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_max_fee_from_base_and_tip() {
        assert_eq!(
            suggested_max_fee(Some(gwei_u(100)), Some(gwei_u(30))),
            Some(gwei_u(230))
        );
    }

    #[test]
    fn test_max_fee_from_base_alone() {
        assert_eq!(suggested_max_fee(Some(gwei_u(100)), None), Some(gwei_u(200)));
        assert_eq!(suggested_max_fee(None, Some(gwei_u(30))), None);
        assert_eq!(suggested_max_fee(Some(U256::MAX), Some(gwei_u(30))), Some(U256::MAX));
    }

    #[test]
    fn test_node_rejection_is_not_retryable() {
        let rejection = ProviderError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(
            JsonRpcError {
                code: -32000,
                message: "max fee per gas less than block base fee".to_string(),
                data: None,
            },
        )));
        let err = send_error(rejection);
        assert!(matches!(err, OpsError::Broadcast(ref m) if m.contains("less than block base fee")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_garbled_response_is_transport_failure() {
        let garbled = ProviderError::JsonRpcClientError(Box::new(HttpClientError::SerdeJson {
            err: serde_json::from_str::<serde_json::Value>("<html>").unwrap_err(),
            text: "<html>".to_string(),
        }));
        assert!(send_error(garbled).is_retryable());
    }
}
