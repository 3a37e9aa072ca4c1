//! Chain module - JSON-RPC access to the target chain
//!
//! The submission controller only talks to the chain through [`ChainClient`],
//! so it can be exercised without a node. [`ChainProvider`] is the ethers
//! implementation with multi-RPC failover.

pub mod provider;

pub use provider::ChainProvider;

use crate::error::OpsResult;
use crate::tx::FeeQuote;

use async_trait::async_trait;
use ethers::types::{Address, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256};

/// Block tag used when counting an account's transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Transactions included in the latest block
    Latest,
    /// Latest plus those sitting in the node's mempool
    Pending,
}

impl From<NonceTag> for BlockNumber {
    fn from(tag: NonceTag) -> Self {
        match tag {
            NonceTag::Latest => BlockNumber::Latest,
            NonceTag::Pending => BlockNumber::Pending,
        }
    }
}

/// Read/broadcast surface of a JSON-RPC node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID transactions are signed for
    fn chain_id(&self) -> u64;

    /// Current fee conditions; fields the node cannot provide are `None`
    async fn fee_quote(&self) -> OpsResult<FeeQuote>;

    /// Transaction count of `account` at `tag`
    async fn nonce(&self, account: Address, tag: NonceTag) -> OpsResult<u64>;

    /// Native (gas asset) balance
    async fn native_balance(&self, account: Address) -> OpsResult<U256>;

    /// Read-only `eth_call`
    async fn call(&self, to: Address, data: Bytes) -> OpsResult<Bytes>;

    /// Broadcast a signed transaction, returning its hash
    async fn send_raw_transaction(&self, raw: Bytes) -> OpsResult<H256>;

    /// Transaction as the node knows it, mined or pending
    async fn transaction(&self, hash: H256) -> OpsResult<Option<Transaction>>;

    /// Receipt if the transaction has been mined
    async fn transaction_receipt(&self, hash: H256) -> OpsResult<Option<TransactionReceipt>>;

    /// Best-effort revert reason for a mined, failed transaction
    async fn revert_reason(&self, hash: H256) -> Option<String>;
}
