//! Bounded confirmation waiting
//!
//! A confirmation wait is raced against a timer. Losing the race does not
//! cancel anything on-chain: the transaction is already broadcast and may
//! still be mined, so a timeout is reported as an unknown outcome.

use super::gas::fee_paid;
use crate::chain::ChainClient;
use crate::error::{OpsError, OpsResult};

use ethers::types::{TransactionReceipt, H256, U256, U64};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a confirmed submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    pub hash: H256,
    pub confirmed_block: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

impl SubmissionResult {
    pub fn from_receipt(receipt: &TransactionReceipt) -> Self {
        Self {
            hash: receipt.transaction_hash,
            confirmed_block: receipt.block_number.map(|b| b.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }
    }

    /// Native fee paid, when the receipt reported both factors
    pub fn total_fee(&self) -> Option<U256> {
        match (self.gas_used, self.effective_gas_price) {
            (Some(gas), Some(price)) => Some(fee_paid(gas, price)),
            _ => None,
        }
    }
}

/// Race `confirmation` against `max_wait`
pub async fn wait_with_deadline<F>(
    label: &str,
    hash: H256,
    confirmation: F,
    max_wait: Duration,
) -> OpsResult<TransactionReceipt>
where
    F: Future<Output = OpsResult<TransactionReceipt>>,
{
    match tokio::time::timeout(max_wait, confirmation).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "{} still pending after {}s (tx {:?}); it may confirm later",
                label,
                max_wait.as_secs(),
                hash
            );
            Err(OpsError::ConfirmationTimeout {
                label: label.to_string(),
                hash,
                waited: max_wait,
            })
        }
    }
}

/// Poll for a receipt until one exists. Unbounded on its own; callers race
/// it with [`wait_with_deadline`].
pub async fn await_receipt(
    client: &dyn ChainClient,
    hash: H256,
    interval: Duration,
) -> OpsResult<TransactionReceipt> {
    loop {
        match client.transaction_receipt(hash).await {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => debug!("No receipt yet for {:?}", hash),
            Err(e) => warn!("Receipt query for {:?} failed: {}", hash, e),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for `hash` to be mined within `max_wait` and classify the receipt
pub async fn confirm(
    client: &dyn ChainClient,
    label: &str,
    hash: H256,
    max_wait: Duration,
    poll_interval: Duration,
) -> OpsResult<SubmissionResult> {
    info!("Waiting for {} confirmation (timeout: {}s)", label, max_wait.as_secs());

    let receipt = wait_with_deadline(
        label,
        hash,
        await_receipt(client, hash, poll_interval),
        max_wait,
    )
    .await?;

    classify_receipt(client, label, &receipt).await
}

/// Turn a mined receipt into a result, surfacing reverts as errors
pub async fn classify_receipt(
    client: &dyn ChainClient,
    label: &str,
    receipt: &TransactionReceipt,
) -> OpsResult<SubmissionResult> {
    if receipt.status == Some(U64::zero()) {
        let reason = client
            .revert_reason(receipt.transaction_hash)
            .await
            .unwrap_or_else(|| "execution reverted".to_string());
        error!("{} reverted (tx {:?}): {}", label, receipt.transaction_hash, reason);
        return Err(OpsError::OnChainRevert {
            label: label.to_string(),
            hash: receipt.transaction_hash,
            reason,
        });
    }

    let result = SubmissionResult::from_receipt(receipt);
    info!(
        "{} confirmed in block {:?} (gas used {:?})",
        label, result.confirmed_block, result.gas_used
    );
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MockChainClient;

    pub(crate) fn receipt(hash: H256, status: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(1_000)),
            gas_used: Some(U256::from(50_000u64)),
            effective_gas_price: Some(U256::from(30_000_000_000u64)),
            status: Some(U64::from(status)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_confirmation_is_timeout() {
        let hash = H256::repeat_byte(0xab);
        let late = async move {
            tokio::time::sleep(Duration::from_secs(301)).await;
            Ok(receipt(hash, 1))
        };

        let err = wait_with_deadline("transfer", hash, late, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ConfirmationTimeout { hash: h, .. } if h == hash));
        assert!(err.is_unknown_outcome());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_within_bound() {
        let hash = H256::repeat_byte(0x01);
        let mut client = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_transaction_receipt()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        client
            .expect_transaction_receipt()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |h| Ok(Some(receipt(h, 1))));

        let result = confirm(&client, "approve", hash, Duration::from_secs(300), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.hash, hash);
        assert_eq!(result.confirmed_block, Some(1_000));
        assert_eq!(
            result.total_fee(),
            Some(U256::from(50_000u64) * U256::from(30_000_000_000u64))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_is_distinct_from_timeout() {
        let hash = H256::repeat_byte(0x02);
        let mut client = MockChainClient::new();
        client
            .expect_transaction_receipt()
            .returning(move |h| Ok(Some(receipt(h, 0))));
        client
            .expect_revert_reason()
            .returning(|_| Some("ERC20: transfer amount exceeds balance".to_string()));

        let err = confirm(&client, "transfer", hash, Duration::from_secs(300), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            OpsError::OnChainRevert { reason, .. } => {
                assert!(reason.contains("exceeds balance"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_receipt_times_out() {
        let mut client = MockChainClient::new();
        client.expect_transaction_receipt().returning(|_| Ok(None));

        let err = confirm(
            &client,
            "buyGas",
            H256::repeat_byte(0x03),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OpsError::ConfirmationTimeout { .. }));
    }
}
