//! Same-nonce replacement for a transaction whose confirmation wait timed out
//!
//! Takes the hash from a report with `outcomeUnknown`, looks the transaction
//! up and, unless its nonce has already landed, resends the same call with
//! outbidding fees from the account that signed it.

use super::{OperationReport, OpsContext};
use crate::error::{OpsError, OpsResult};
use crate::tx::{Eip1559Fees, TransactionSender, TxCall, TxOptions};

use ethers::signers::Signer;
use ethers::types::{Address, Transaction, H256};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SpeedUpRequest {
    pub hash: H256,
    pub bump_percent: Option<u64>,
}

/// Call and options of `tx` as the node reports them
pub fn replay_parts(tx: &Transaction) -> OpsResult<(TxCall, TxOptions)> {
    let to = tx
        .to
        .ok_or_else(|| OpsError::Internal(format!("{:?} is a contract creation", tx.hash)))?;

    // legacy transactions carry a single gas price
    let legacy = tx.gas_price.unwrap_or_default();
    let fees = Eip1559Fees {
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas.unwrap_or(legacy),
        max_fee_per_gas: tx.max_fee_per_gas.unwrap_or(legacy),
    };

    let call = TxCall {
        to,
        data: tx.input.clone(),
        value: tx.value,
        gas_limit: tx.gas,
    };
    let options = TxOptions {
        fees,
        nonce: tx.nonce.low_u64(),
        gas_limit: tx.gas,
        value: tx.value,
    };
    Ok((call, options))
}

/// Sender for whichever configured account signed `from`
fn sender_for(ctx: &OpsContext, from: Address, bump_percent: Option<u64>) -> OpsResult<TransactionSender> {
    let settings = &ctx.settings;
    let signed_by = |wallet: OpsResult<ethers::signers::LocalWallet>| {
        wallet.map(|w| w.address() == from).unwrap_or(false)
    };

    if signed_by(settings.require_eoa_wallet()) {
        ctx.eoa_sender(bump_percent)
    } else if signed_by(settings.require_relayer_wallet()) {
        ctx.relayer_sender(bump_percent)
    } else {
        Err(OpsError::config(
            "accounts",
            format!("{:?} is neither the owner EOA nor the relayer account", from),
        ))
    }
}

pub async fn speed_up(ctx: &OpsContext, request: &SpeedUpRequest) -> OpsResult<OperationReport> {
    let tx = ctx
        .client()
        .transaction(request.hash)
        .await?
        .ok_or_else(|| OpsError::Chain(format!("transaction {:?} not found", request.hash)))?;

    let sender = sender_for(ctx, tx.from, request.bump_percent)?;
    let (call, previous) = replay_parts(&tx)?;
    info!(
        "Re-checking {:?} from {:?} with nonce {}",
        request.hash, tx.from, previous.nonce
    );

    let result = sender
        .speed_up("speed-up", &call, &previous, request.hash)
        .await?;

    Ok(OperationReport::submitted("speed-up", [&result])
        .with_explorer(&ctx.settings)
        .with_details(json!({
            "original": request.hash,
            "from": tx.from,
            "nonce": previous.nonce,
            "replaced": result.hash != request.hash,
        })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, NonceTag};
    use crate::ops::tests::keyed_settings;
    use crate::tx::confirm::tests::receipt;
    use crate::tx::sender::tests::{gwei_u, test_wallet};
    use ethers::types::{Bytes, U256, U64};
    use mockall::predicate::{always, eq};
    use std::sync::Arc;

    fn pending_tx(from: Address) -> Transaction {
        Transaction {
            hash: H256::repeat_byte(0x77),
            nonce: U256::from(7u64),
            from,
            to: Some(Address::repeat_byte(0x27)),
            value: U256::zero(),
            gas: U256::from(100_000u64),
            input: Bytes::from(vec![0xa9u8, 0x05, 0x9c, 0xbb]),
            max_priority_fee_per_gas: Some(gwei_u(45)),
            max_fee_per_gas: Some(gwei_u(135)),
            transaction_type: Some(U64::from(2u64)),
            ..Default::default()
        }
    }

    #[test]
    fn test_replay_parts_keep_call_and_fees() {
        let tx = pending_tx(Address::repeat_byte(0x01));
        let (call, options) = replay_parts(&tx).unwrap();
        assert_eq!(call.to, Address::repeat_byte(0x27));
        assert_eq!(call.data, tx.input);
        assert_eq!(options.nonce, 7);
        assert_eq!(options.gas_limit, U256::from(100_000u64));
        assert_eq!(options.fees.max_fee_per_gas, gwei_u(135));

        let legacy = Transaction {
            gas_price: Some(gwei_u(60)),
            max_priority_fee_per_gas: None,
            max_fee_per_gas: None,
            ..tx
        };
        let (_, options) = replay_parts(&legacy).unwrap();
        assert_eq!(options.fees.max_priority_fee_per_gas, gwei_u(60));
        assert_eq!(options.fees.max_fee_per_gas, gwei_u(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_landed_nonce_is_not_resent() {
        let from = test_wallet().address();
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client
            .expect_transaction()
            .returning(move |_| Ok(Some(pending_tx(from))));
        client
            .expect_nonce()
            .with(always(), eq(NonceTag::Latest))
            .returning(|_, _| Ok(8));
        client
            .expect_nonce()
            .with(always(), eq(NonceTag::Pending))
            .returning(|_, _| Ok(8));
        client
            .expect_transaction_receipt()
            .returning(|h| Ok(Some(receipt(h, 1))));
        client.expect_send_raw_transaction().times(0);

        let ctx = OpsContext::new(keyed_settings(), Arc::new(client));
        let request = SpeedUpRequest {
            hash: H256::repeat_byte(0x77),
            bump_percent: None,
        };
        let report = speed_up(&ctx, &request).await.unwrap();
        assert!(report.success);
        assert_eq!(report.transaction_hash, Some(H256::repeat_byte(0x77)));
        assert_eq!(report.details["replaced"], false);
    }

    #[tokio::test]
    async fn test_foreign_sender_rejected() {
        let mut client = MockChainClient::new();
        client
            .expect_transaction()
            .returning(|_| Ok(Some(pending_tx(Address::repeat_byte(0x99)))));
        client.expect_send_raw_transaction().times(0);

        let ctx = OpsContext::new(keyed_settings(), Arc::new(client));
        let request = SpeedUpRequest {
            hash: H256::repeat_byte(0x77),
            bump_percent: None,
        };
        let err = speed_up(&ctx, &request).await.unwrap_err();
        assert!(matches!(err, OpsError::Config { field, .. } if field == "accounts"));
    }

    #[tokio::test]
    async fn test_unknown_hash() {
        let mut client = MockChainClient::new();
        client.expect_transaction().returning(|_| Ok(None));

        let ctx = OpsContext::new(keyed_settings(), Arc::new(client));
        let request = SpeedUpRequest {
            hash: H256::repeat_byte(0x01),
            bump_percent: None,
        };
        assert!(speed_up(&ctx, &request).await.is_err());
    }
}
