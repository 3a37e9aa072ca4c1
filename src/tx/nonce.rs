//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking per account so dependent steps are ordered
//! - Detecting transactions queued in the mempool ahead of a new submission
//! - Rolling back a nonce only when its transaction never reached the node

use super::poll::{poll_until, PollOutcome, PollSchedule};
use crate::chain::{ChainClient, NonceTag};
use crate::error::{OpsError, OpsResult};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Observed nonce counts for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTxState {
    pub latest_nonce: u64,
    pub pending_nonce: u64,
}

impl PendingTxState {
    /// Unconfirmed transactions are sitting in the mempool
    pub fn has_outstanding(&self) -> bool {
        self.pending_nonce > self.latest_nonce
    }

    pub fn outstanding(&self) -> u64 {
        self.pending_nonce.saturating_sub(self.latest_nonce)
    }
}

/// Query latest and pending counts concurrently
pub async fn pending_state(client: &dyn ChainClient, account: Address) -> OpsResult<PendingTxState> {
    let (latest_nonce, pending_nonce) = tokio::try_join!(
        client.nonce(account, NonceTag::Latest),
        client.nonce(account, NonceTag::Pending),
    )?;
    Ok(PendingTxState {
        latest_nonce,
        pending_nonce,
    })
}

/// Waits until an account has no unconfirmed transactions queued
#[derive(Debug, Clone, Copy)]
pub struct PendingQueueGuard {
    schedule: PollSchedule,
}

impl PendingQueueGuard {
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            schedule: PollSchedule::new(poll_interval, max_wait),
        }
    }

    /// Block until `pending <= latest` or the wait bound elapses.
    ///
    /// Read-only: nothing is sent, replaced or cancelled.
    pub async fn wait_for_drain(
        &self,
        client: &dyn ChainClient,
        account: Address,
    ) -> OpsResult<PendingTxState> {
        let outcome = poll_until("pending queue drain", self.schedule, move || async move {
            let state = pending_state(client, account).await?;
            if state.has_outstanding() {
                warn!(
                    "{:?} has {} pending transaction(s); a new one would queue behind them",
                    account,
                    state.outstanding()
                );
                Ok(None)
            } else {
                Ok(Some(state))
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(state) => {
                debug!("No pending transactions for {:?} (nonce {})", account, state.latest_nonce);
                Ok(state)
            }
            PollOutcome::TimedOut { elapsed } => {
                Err(OpsError::PendingQueueTimeout { account, elapsed })
            }
        }
    }
}

/// Per-account nonce state
#[derive(Debug, Default)]
struct AccountNonces {
    /// Next nonce to hand out
    next: u64,
    /// Broadcast but unconfirmed: nonce -> tx hash
    in_flight: BTreeMap<u64, H256>,
    initialized: bool,
}

/// Hands out nonces monotonically per account
#[derive(Default)]
pub struct NonceAllocator {
    accounts: DashMap<Address, Arc<Mutex<AccountNonces>>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, account: Address) -> Arc<Mutex<AccountNonces>> {
        self.accounts.entry(account).or_default().clone()
    }

    /// Allocate the next nonce, never below the chain's pending count
    pub async fn allocate(&self, client: &dyn ChainClient, account: Address) -> OpsResult<u64> {
        let on_chain = client.nonce(account, NonceTag::Pending).await?;

        let state = self.state(account);
        let mut state = state.lock().await;

        if !state.initialized {
            state.next = on_chain;
            state.initialized = true;
        } else if on_chain > state.next {
            info!(
                "Nonce for {:?} advanced externally: local {}, chain {}",
                account, state.next, on_chain
            );
            state.next = on_chain;
        }

        let nonce = state.next;
        state.next += 1;

        debug!("Allocated nonce {} for {:?}", nonce, account);
        Ok(nonce)
    }

    /// Record the transaction broadcast with `nonce`
    pub async fn mark_pending(&self, account: Address, nonce: u64, tx_hash: H256) {
        let state = self.state(account);
        state.lock().await.in_flight.insert(nonce, tx_hash);
    }

    /// Transaction with `nonce` was mined
    pub async fn confirm(&self, account: Address, nonce: u64) {
        let state = self.state(account);
        state.lock().await.in_flight.remove(&nonce);
    }

    /// Give back a nonce whose transaction was rejected before reaching the
    /// mempool. Returns false (and keeps the nonce consumed) if anything was
    /// broadcast with it or later nonces were handed out.
    pub async fn release(&self, account: Address, nonce: u64) -> bool {
        let state = self.state(account);
        let mut state = state.lock().await;

        if state.in_flight.contains_key(&nonce) {
            warn!("Refusing to release nonce {} for {:?}: already broadcast", nonce, account);
            return false;
        }

        if state.next == nonce + 1 {
            state.next = nonce;
            debug!("Released nonce {} for {:?}", nonce, account);
            true
        } else {
            false
        }
    }
}
