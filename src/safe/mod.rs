//! Gnosis Safe batch execution for 1-of-1 owner Safes
//!
//! Calls are collected into a [`SafeBatch`]. A single call is executed
//! directly; several are packed for `MultiSendCallOnly` and executed by
//! delegatecall, so the whole batch lands atomically in one transaction
//! sent by the owner EOA.

use crate::config::Settings;
use crate::contracts::{read, safe as bindings};
use crate::error::{OpsError, OpsResult};
use crate::tx::{SubmissionResult, TransactionSender, TxCall};

use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use tracing::{debug, info};

/// Safe operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Call = 0,
    DelegateCall = 1,
}

impl Operation {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One call made by the Safe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: Operation,
}

impl MetaTransaction {
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            value: U256::zero(),
            data: data.into(),
            operation: Operation::Call,
        }
    }
}

/// Ordered calls executed atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafeBatch {
    transactions: Vec<MetaTransaction>,
}

impl SafeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, tx: MetaTransaction) -> Self {
        self.transactions.push(tx);
        self
    }

    /// Append `tx` only when `needed`
    pub fn push_if(self, needed: bool, tx: MetaTransaction) -> Self {
        if needed {
            self.push(tx)
        } else {
            self
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[MetaTransaction] {
        &self.transactions
    }

    /// Collapse into the single call the Safe executes
    pub fn into_meta(self, multisend: Address) -> OpsResult<MetaTransaction> {
        if self.is_empty() {
            return Err(OpsError::Internal("empty Safe batch".to_string()));
        }

        let mut transactions = self.transactions;
        if transactions.len() == 1 {
            return Ok(transactions.remove(0));
        }
        Ok(MetaTransaction {
            to: multisend,
            value: U256::zero(),
            data: multisend_data(&transactions).into(),
            operation: Operation::DelegateCall,
        })
    }
}

/// `operation(1) || to(20) || value(32) || len(32) || data` per call
pub fn pack_multisend(transactions: &[MetaTransaction]) -> Vec<u8> {
    let mut packed = Vec::new();
    for tx in transactions {
        packed.push(tx.operation.as_u8());
        packed.extend_from_slice(tx.to.as_bytes());

        let mut word = [0u8; 32];
        tx.value.to_big_endian(&mut word);
        packed.extend_from_slice(&word);

        U256::from(tx.data.len()).to_big_endian(&mut word);
        packed.extend_from_slice(&word);

        packed.extend_from_slice(&tx.data);
    }
    packed
}

fn multisend_data(transactions: &[MetaTransaction]) -> Vec<u8> {
    crate::contracts::multisend::MultiSendCall {
        transactions: pack_multisend(transactions).into(),
    }
    .encode()
}

/// Refund parameters attached to every Safe transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeTxParams {
    pub safe_tx_gas: U256,
    pub gas_price: U256,
}

impl SafeTxParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            safe_tx_gas: U256::from(settings.safe.safe_tx_gas),
            gas_price: settings.safe_gas_price(),
        }
    }

    pub fn with_safe_tx_gas(mut self, safe_tx_gas: u64) -> Self {
        self.safe_tx_gas = U256::from(safe_tx_gas);
        self
    }
}

/// Signs Safe transactions with the owner key and submits them from the owner EOA
pub struct SafeExecutor<'a> {
    sender: &'a TransactionSender,
    safe: Address,
    multisend: Address,
    params: SafeTxParams,
    exec_gas_limit: u64,
}

impl<'a> SafeExecutor<'a> {
    pub fn new(
        sender: &'a TransactionSender,
        safe: Address,
        multisend: Address,
        params: SafeTxParams,
        exec_gas_limit: u64,
    ) -> Self {
        Self {
            sender,
            safe,
            multisend,
            params,
            exec_gas_limit,
        }
    }

    pub fn address(&self) -> Address {
        self.safe
    }

    pub async fn nonce(&self) -> OpsResult<U256> {
        let bindings::NonceReturn(nonce) = read(self.sender.client(), self.safe, bindings::NonceCall).await?;
        Ok(nonce)
    }

    /// Owner signatures the Safe requires
    pub async fn threshold(&self) -> OpsResult<U256> {
        let bindings::GetThresholdReturn(threshold) =
            read(self.sender.client(), self.safe, bindings::GetThresholdCall).await?;
        Ok(threshold)
    }

    /// Hash the owner signs, as computed by the Safe itself
    pub async fn transaction_hash(&self, meta: &MetaTransaction, nonce: U256) -> OpsResult<H256> {
        let call = bindings::GetTransactionHashCall {
            to: meta.to,
            value: meta.value,
            data: meta.data.clone(),
            operation: meta.operation.as_u8(),
            safe_tx_gas: self.params.safe_tx_gas,
            base_gas: U256::zero(),
            gas_price: self.params.gas_price,
            gas_token: Address::zero(),
            refund_receiver: Address::zero(),
            tx_nonce: nonce,
        };
        let bindings::GetTransactionHashReturn(hash) = read(self.sender.client(), self.safe, call).await?;
        Ok(H256::from(hash))
    }

    /// 65-byte `r || s || v` owner signature over the Safe transaction hash
    pub fn sign(&self, hash: H256) -> OpsResult<Bytes> {
        let signature = self.sender.wallet().sign_hash(hash)?;
        Ok(signature.to_vec().into())
    }

    fn exec_call(&self, meta: &MetaTransaction, signature: Bytes) -> TxCall {
        let data = bindings::ExecTransactionCall {
            to: meta.to,
            value: meta.value,
            data: meta.data.clone(),
            operation: meta.operation.as_u8(),
            safe_tx_gas: self.params.safe_tx_gas,
            base_gas: U256::zero(),
            gas_price: self.params.gas_price,
            gas_token: Address::zero(),
            refund_receiver: Address::zero(),
            signatures: signature,
        }
        .encode();
        TxCall::new(self.safe, data, self.exec_gas_limit)
    }

    /// Sign and execute `batch`, waiting for confirmation. Nothing is sent
    /// unless the Safe's threshold is 1.
    pub async fn execute(&self, label: &str, batch: SafeBatch) -> OpsResult<SubmissionResult> {
        let calls = batch.len();
        let meta = batch.into_meta(self.multisend)?;

        let (nonce, threshold) = tokio::try_join!(self.nonce(), self.threshold())?;
        if threshold != U256::one() {
            return Err(OpsError::config(
                "accounts.safe_address",
                format!(
                    "Safe {:?} has threshold {}; only single-owner Safes are supported",
                    self.safe, threshold
                ),
            ));
        }

        let hash = self.transaction_hash(&meta, nonce).await?;
        debug!(
            "Safe {:?} nonce {} tx hash {:?} (to {:?}, selector 0x{})",
            self.safe,
            nonce,
            hash,
            meta.to,
            hex::encode(meta.data.get(..4).unwrap_or_default())
        );

        let signature = self.sign(hash)?;
        info!(
            "Executing {} through Safe {:?} ({} call(s), owner {:?})",
            label,
            self.safe,
            calls,
            self.sender.address()
        );

        self.sender
            .submit_and_wait(label, &self.exec_call(&meta, signature))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::tests::uint_word;
    use crate::tx::confirm::tests::receipt;
    use crate::tx::sender::tests::{base_client, sender, test_wallet};
    use ethers::abi::AbiDecode;
    use ethers::signers::Signer;
    use ethers::types::Signature;
    use ethers::utils::keccak256;

    fn multisend() -> Address {
        Address::repeat_byte(0x40)
    }

    #[test]
    fn test_pack_layout() {
        let txs = vec![
            MetaTransaction::call(Address::repeat_byte(0x27), vec![0xaau8, 0xbb]),
            MetaTransaction::call(Address::repeat_byte(0x26), Vec::<u8>::new()),
        ];
        let packed = pack_multisend(&txs);
        assert_eq!(packed.len(), (1 + 20 + 32 + 32 + 2) + (1 + 20 + 32 + 32));

        assert_eq!(packed[0], 0);
        assert_eq!(&packed[1..21], Address::repeat_byte(0x27).as_bytes());
        assert!(packed[21..53].iter().all(|b| *b == 0));
        assert_eq!(packed[84], 2);
        assert_eq!(&packed[85..87], &[0xaa, 0xbb]);
        assert_eq!(&packed[88..108], Address::repeat_byte(0x26).as_bytes());
    }

    #[test]
    fn test_single_call_not_wrapped() {
        let tx = MetaTransaction::call(Address::repeat_byte(0x27), vec![0x01u8]);
        let meta = SafeBatch::new().push(tx.clone()).into_meta(multisend()).unwrap();
        assert_eq!(meta, tx);
    }

    #[test]
    fn test_batch_uses_delegatecall_multisend() {
        let batch = SafeBatch::new()
            .push(MetaTransaction::call(Address::repeat_byte(0x27), vec![0x01u8]))
            .push_if(false, MetaTransaction::call(Address::repeat_byte(0x22), vec![0x02u8]))
            .push(MetaTransaction::call(Address::repeat_byte(0x10), vec![0x03u8]));
        assert_eq!(batch.len(), 2);

        let packed = pack_multisend(batch.transactions());
        let meta = batch.into_meta(multisend()).unwrap();
        assert_eq!(meta.to, multisend());
        assert_eq!(meta.operation, Operation::DelegateCall);

        let call = crate::contracts::multisend::MultiSendCall::decode(&meta.data).unwrap();
        assert_eq!(call.transactions.to_vec(), packed);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(SafeBatch::new().into_meta(multisend()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_signs_safe_hash() {
        let safe_hash = H256::repeat_byte(0x5a);
        let mut client = base_client(2, U256::exp10(18));
        client.expect_call().returning(move |_, data| {
            if data[..4] == [0xaf, 0xfe, 0xd0, 0xe0] {
                Ok(uint_word(U256::from(11u64)))
            } else if data[..4] == [0xe7, 0x52, 0x35, 0xb8] {
                Ok(uint_word(U256::one()))
            } else {
                Ok(Bytes::from(safe_hash.as_bytes().to_vec()))
            }
        });
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        client
            .expect_transaction_receipt()
            .returning(|h| Ok(Some(receipt(h, 1))));

        let sender = sender(client);
        let params = SafeTxParams {
            safe_tx_gas: U256::from(500_000u64),
            gas_price: U256::from(25_000_000_000u64),
        };
        let executor = SafeExecutor::new(&sender, Address::repeat_byte(0x5f), multisend(), params, 600_000);

        assert_eq!(executor.nonce().await.unwrap(), U256::from(11u64));

        let signature = executor.sign(safe_hash).unwrap();
        assert_eq!(signature.len(), 65);
        let parsed = Signature::try_from(signature.as_ref()).unwrap();
        assert_eq!(parsed.recover(safe_hash).unwrap(), test_wallet().address());

        let batch = SafeBatch::new()
            .push(MetaTransaction::call(Address::repeat_byte(0x27), vec![0x01u8]))
            .push(MetaTransaction::call(Address::repeat_byte(0x26), vec![0x02u8]));
        let result = executor.execute("buyGas batch", batch).await.unwrap();
        assert_eq!(result.confirmed_block, Some(1_000));
    }

    #[tokio::test]
    async fn test_multi_owner_safe_rejected_before_signing() {
        let mut client = base_client(2, U256::exp10(18));
        client.expect_call().returning(|_, data| {
            if data[..4] == [0xe7, 0x52, 0x35, 0xb8] {
                Ok(uint_word(U256::from(2u64)))
            } else {
                Ok(uint_word(U256::from(11u64)))
            }
        });
        client.expect_send_raw_transaction().times(0);

        let sender = sender(client);
        let params = SafeTxParams {
            safe_tx_gas: U256::from(500_000u64),
            gas_price: U256::zero(),
        };
        let executor = SafeExecutor::new(&sender, Address::repeat_byte(0x5f), multisend(), params, 600_000);

        let batch = SafeBatch::new().push(MetaTransaction::call(Address::repeat_byte(0x27), vec![0x01u8]));
        let err = executor.execute("transfer", batch).await.unwrap_err();
        match err {
            OpsError::Config { field, message } => {
                assert_eq!(field, "accounts.safe_address");
                assert!(message.contains("threshold 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
