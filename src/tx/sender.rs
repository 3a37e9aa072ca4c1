//! Transaction sender with retry logic and stuck transaction handling

use super::confirm::{classify_receipt, confirm, SubmissionResult};
use super::gas::{gwei, max_cost, replacement_fees, resolve_fees, Eip1559Fees, GasPolicy};
use super::nonce::{pending_state, NonceAllocator, PendingQueueGuard};
use crate::chain::ChainClient;
use crate::config::Settings;
use crate::error::{OpsError, OpsResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::format_ether;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Contract call (or plain transfer) to submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Fixed gas limit; the scripts never estimate
    pub gas_limit: U256,
}

impl TxCall {
    pub fn new(to: Address, data: impl Into<Bytes>, gas_limit: u64) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::zero(),
            gas_limit: U256::from(gas_limit),
        }
    }
}

/// Everything attached to a call before signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub fees: Eip1559Fees,
    pub nonce: u64,
    pub gas_limit: U256,
    pub value: U256,
}

/// Timing knobs for broadcast and confirmation
#[derive(Debug, Clone, Copy)]
pub struct SubmitTimings {
    pub confirmation: Duration,
    pub receipt_poll_interval: Duration,
    pub broadcast_retries: u32,
    pub retry_delay: Duration,
    pub replacement_bump_percent: u64,
}

impl SubmitTimings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            confirmation: settings.confirmation_timeout(),
            receipt_poll_interval: settings.receipt_poll_interval(),
            broadcast_retries: settings.timeouts.broadcast_retries.max(1),
            retry_delay: Duration::from_millis(settings.timeouts.retry_delay_ms),
            replacement_bump_percent: settings.gas.replacement_bump_percent,
        }
    }
}

/// Signs with one externally-owned account and submits through a [`ChainClient`]
pub struct TransactionSender {
    client: Arc<dyn ChainClient>,
    wallet: LocalWallet,
    policy: GasPolicy,
    nonces: Arc<NonceAllocator>,
    guard: Option<PendingQueueGuard>,
    timings: SubmitTimings,
}

impl TransactionSender {
    pub fn new(
        client: Arc<dyn ChainClient>,
        wallet: LocalWallet,
        policy: GasPolicy,
        nonces: Arc<NonceAllocator>,
        timings: SubmitTimings,
    ) -> Self {
        let wallet = wallet.with_chain_id(client.chain_id());
        info!("Transaction sender initialized with wallet: {:?}", wallet.address());
        Self {
            client,
            wallet,
            policy,
            nonces,
            guard: None,
            timings,
        }
    }

    /// Sender configured from settings, with an optional per-call bump override
    pub fn from_settings(
        client: Arc<dyn ChainClient>,
        wallet: LocalWallet,
        nonces: Arc<NonceAllocator>,
        settings: &Settings,
        bump_percent: Option<u64>,
    ) -> OpsResult<Self> {
        let policy = settings.gas_policy_with_bump(bump_percent)?;
        let sender = Self::new(client, wallet, policy, nonces, SubmitTimings::from_settings(settings));

        if settings.policy.wait_for_pending_drain {
            Ok(sender.with_pending_guard(PendingQueueGuard::new(
                Duration::from_secs(settings.timeouts.pending_drain_secs),
                Duration::from_millis(settings.timeouts.pending_poll_interval_ms),
            )))
        } else {
            Ok(sender)
        }
    }

    /// Refuse to submit while earlier transactions are still queued
    pub fn with_pending_guard(mut self, guard: PendingQueueGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    pub fn client(&self) -> &dyn ChainClient {
        self.client.as_ref()
    }

    /// Resolve fees from a fresh quote and allocate a nonce
    pub async fn prepare(&self, call: &TxCall, nonce: Option<u64>) -> OpsResult<TxOptions> {
        let quote = self.client.fee_quote().await?;
        let fees = resolve_fees(&quote, &self.policy);

        let nonce = match nonce {
            Some(n) => n,
            None => self.nonces.allocate(self.client.as_ref(), self.address()).await?,
        };

        Ok(TxOptions {
            fees,
            nonce,
            gas_limit: call.gas_limit,
            value: call.value,
        })
    }

    /// The account must hold `gas_limit * max_fee + value` before broadcast
    pub async fn preflight(&self, options: &TxOptions) -> OpsResult<()> {
        let need = max_cost(options.gas_limit, &options.fees).saturating_add(options.value);
        let have = self.client.native_balance(self.address()).await?;

        if have < need {
            error!(
                "Insufficient native balance for {:?}: have {}, need {}",
                self.address(),
                format_ether(have),
                format_ether(need)
            );
            return Err(OpsError::InsufficientFunds {
                account: self.address(),
                asset: "POL".to_string(),
                have: format_ether(have),
                need: format_ether(need),
            });
        }
        Ok(())
    }

    fn build_tx(&self, call: &TxCall, options: &TxOptions) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(self.address())
            .to(call.to)
            .data(call.data.clone())
            .value(options.value)
            .nonce(options.nonce)
            .gas(options.gas_limit)
            .max_fee_per_gas(options.fees.max_fee_per_gas)
            .max_priority_fee_per_gas(options.fees.max_priority_fee_per_gas)
            .chain_id(self.client.chain_id())
            .into()
    }

    /// Sign once and send, retrying transport failures only. Every attempt
    /// resends the same bytes, so a retry can never create a second
    /// transaction.
    pub async fn broadcast(&self, call: &TxCall, options: &TxOptions) -> OpsResult<H256> {
        let tx = self.build_tx(call, options);
        let signature = self.wallet.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);
        let local_hash = tx.hash(&signature);

        debug!(
            "Signed tx {:?} nonce {} tip {} gwei max {} gwei",
            local_hash,
            options.nonce,
            gwei(options.fees.max_priority_fee_per_gas),
            gwei(options.fees.max_fee_per_gas)
        );

        let max_attempts = self.timings.broadcast_retries.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;

            match self.client.send_raw_transaction(raw.clone()).await {
                Ok(tx_hash) => {
                    info!(
                        "Transaction sent: {:?} (attempt {}/{})",
                        tx_hash, attempts, max_attempts
                    );
                    return Ok(tx_hash);
                }
                Err(e) => {
                    let error_msg = e.to_string().to_lowercase();

                    if error_msg.contains("already known") || error_msg.contains("known transaction") {
                        info!("Node already has {:?}", local_hash);
                        return Ok(local_hash);
                    } else if error_msg.contains("insufficient funds") {
                        let need = max_cost(options.gas_limit, &options.fees).saturating_add(options.value);
                        let have = match self.client.native_balance(self.address()).await {
                            Ok(balance) => format_ether(balance),
                            Err(_) => "unknown".to_string(),
                        };
                        return Err(OpsError::InsufficientFunds {
                            account: self.address(),
                            asset: "POL".to_string(),
                            have,
                            need: format_ether(need),
                        });
                    } else if error_msg.contains("nonce too low") {
                        return Err(OpsError::Nonce {
                            account: self.address(),
                            message: format!("nonce {} already used", options.nonce),
                        });
                    } else if error_msg.contains("replacement transaction underpriced") {
                        return Err(OpsError::Broadcast(format!(
                            "nonce {} is occupied by a pending transaction with higher fees",
                            options.nonce
                        )));
                    }

                    if !e.is_retryable() {
                        error!("Node rejected {:?}: {}", local_hash, e);
                        return Err(e);
                    }

                    warn!("Broadcast attempt {}/{} failed: {}", attempts, max_attempts, e);
                    last_error = Some(e);
                }
            }

            if attempts < max_attempts {
                tokio::time::sleep(self.timings.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| OpsError::Broadcast("Unknown error".to_string())))
    }

    /// Guard, prepare, pre-flight, broadcast and wait for one transaction
    pub async fn submit_and_wait(&self, label: &str, call: &TxCall) -> OpsResult<SubmissionResult> {
        if let Some(guard) = &self.guard {
            guard.wait_for_drain(self.client.as_ref(), self.address()).await?;
        }

        let options = self.prepare(call, None).await?;
        info!(
            "Submitting {} from {:?} with nonce {}",
            label,
            self.address(),
            options.nonce
        );

        self.send_prepared(label, call, &options).await
    }

    async fn send_prepared(
        &self,
        label: &str,
        call: &TxCall,
        options: &TxOptions,
    ) -> OpsResult<SubmissionResult> {
        let account = self.address();

        if let Err(e) = self.preflight(options).await {
            self.nonces.release(account, options.nonce).await;
            return Err(e);
        }

        let hash = match self.broadcast(call, options).await {
            Ok(hash) => hash,
            Err(e) => {
                self.nonces.release(account, options.nonce).await;
                return Err(e);
            }
        };
        self.nonces.mark_pending(account, options.nonce, hash).await;

        let result = confirm(
            self.client.as_ref(),
            label,
            hash,
            self.timings.confirmation,
            self.timings.receipt_poll_interval,
        )
        .await;

        match &result {
            Err(e) if e.is_unknown_outcome() => {
                warn!("{} left in flight with nonce {}: {:?}", label, options.nonce, hash);
            }
            _ => self.nonces.confirm(account, options.nonce).await,
        }

        result
    }

    /// Replace a transaction whose confirmation wait timed out.
    ///
    /// Re-checks the account first: if the nonce has landed, the previous
    /// transaction's receipt is returned instead of sending anything.
    pub async fn speed_up(
        &self,
        label: &str,
        call: &TxCall,
        previous: &TxOptions,
        previous_hash: H256,
    ) -> OpsResult<SubmissionResult> {
        let account = self.address();
        let state = pending_state(self.client.as_ref(), account).await?;

        if state.latest_nonce > previous.nonce {
            return match self.client.transaction_receipt(previous_hash).await? {
                Some(receipt) => {
                    self.nonces.confirm(account, previous.nonce).await;
                    classify_receipt(self.client.as_ref(), label, &receipt).await
                }
                None => Err(OpsError::Nonce {
                    account,
                    message: format!(
                        "nonce {} was consumed by a different transaction",
                        previous.nonce
                    ),
                }),
            };
        }

        let quote = self.client.fee_quote().await?;
        let fresh = resolve_fees(&quote, &self.policy);
        let fees = replacement_fees(&previous.fees, &fresh, self.timings.replacement_bump_percent);
        let options = TxOptions { fees, ..*previous };

        info!(
            "Speeding up {} with nonce {}: tip {} -> {} gwei",
            label,
            previous.nonce,
            gwei(previous.fees.max_priority_fee_per_gas),
            gwei(fees.max_priority_fee_per_gas)
        );

        self.preflight(&options).await?;
        let hash = self.broadcast(call, &options).await?;
        self.nonces.mark_pending(account, options.nonce, hash).await;

        let result = confirm(
            self.client.as_ref(),
            label,
            hash,
            self.timings.confirmation,
            self.timings.receipt_poll_interval,
        )
        .await;
        if result.is_ok() {
            self.nonces.confirm(account, options.nonce).await;
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{MockChainClient, NonceTag};
    use crate::tx::confirm::tests::receipt;
    use crate::tx::FeeQuote;
    use ethers::utils::keccak256;
    use std::sync::Mutex as StdMutex;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub(crate) fn test_wallet() -> LocalWallet {
        TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(137u64)
    }

    pub(crate) fn timings() -> SubmitTimings {
        SubmitTimings {
            confirmation: Duration::from_secs(300),
            receipt_poll_interval: Duration::from_secs(2),
            broadcast_retries: 3,
            retry_delay: Duration::from_millis(500),
            replacement_bump_percent: 125,
        }
    }

    pub(crate) fn gwei_u(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    /// Mock with the reads every submission performs
    pub(crate) fn base_client(nonce: u64, balance: U256) -> MockChainClient {
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client.expect_fee_quote().returning(|| {
            Ok(FeeQuote {
                base_fee: Some(gwei_u(30)),
                suggested_priority_fee: Some(gwei_u(30)),
                suggested_max_fee: Some(gwei_u(90)),
            })
        });
        client
            .expect_nonce()
            .returning(move |_, _| Ok(nonce));
        client.expect_native_balance().returning(move |_| Ok(balance));
        client
    }

    pub(crate) fn sender(client: MockChainClient) -> TransactionSender {
        let policy = GasPolicy::new(gwei_u(25), 150).unwrap();
        TransactionSender::new(
            Arc::new(client),
            test_wallet(),
            policy,
            Arc::new(NonceAllocator::new()),
            timings(),
        )
    }

    fn call() -> TxCall {
        TxCall::new(Address::repeat_byte(0x42), vec![0xa9u8, 0x05, 0x9c, 0xbb], 100_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_wait_confirms() {
        let mut client = base_client(12, U256::exp10(18));
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        client
            .expect_transaction_receipt()
            .returning(|h| Ok(Some(receipt(h, 1))));

        let sender = sender(client);
        let result = sender.submit_and_wait("transfer", &call()).await.unwrap();
        assert_eq!(result.confirmed_block, Some(1_000));
    }

    #[tokio::test]
    async fn test_prepare_resolves_policy_fees() {
        let sender = sender(base_client(12, U256::exp10(18)));
        let options = sender.prepare(&call(), None).await.unwrap();
        assert_eq!(options.nonce, 12);
        assert_eq!(options.fees.max_priority_fee_per_gas, gwei_u(45));
        assert_eq!(options.fees.max_fee_per_gas, gwei_u(135));
        assert_eq!(options.gas_limit, U256::from(100_000u64));

        let explicit = sender.prepare(&call(), Some(40)).await.unwrap();
        assert_eq!(explicit.nonce, 40);
    }

    #[tokio::test]
    async fn test_preflight_blocks_broadcast() {
        // 100000 gas at 135 gwei needs 0.0135 POL
        let mut client = base_client(0, U256::exp10(15));
        client.expect_send_raw_transaction().times(0);

        let sender = sender(client);
        let err = sender.submit_and_wait("transfer", &call()).await.unwrap_err();
        match err {
            OpsError::InsufficientFunds { have, need, .. } => {
                assert_eq!(have, "0.001000000000000000");
                assert_eq!(need, "0.013500000000000000");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_resends_identical_bytes() {
        let sent = Arc::new(StdMutex::new(Vec::<Bytes>::new()));
        let record = sent.clone();

        let mut client = base_client(3, U256::exp10(18));
        client.expect_send_raw_transaction().times(2).returning(move |raw| {
            let mut sent = record.lock().unwrap();
            sent.push(raw.clone());
            if sent.len() == 1 {
                Err(OpsError::Chain("connection reset by peer".to_string()))
            } else {
                Ok(H256::from(keccak256(&raw)))
            }
        });

        let sender = sender(client);
        let options = sender.prepare(&call(), None).await.unwrap();
        let hash = sender.broadcast(&call(), &options).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(hash, H256::from(keccak256(&sent[0])));
    }

    #[tokio::test]
    async fn test_already_known_uses_local_hash() {
        let sent = Arc::new(StdMutex::new(None::<Bytes>));
        let record = sent.clone();

        let mut client = base_client(3, U256::exp10(18));
        client.expect_send_raw_transaction().times(1).returning(move |raw| {
            *record.lock().unwrap() = Some(raw);
            Err(OpsError::Broadcast("already known".to_string()))
        });

        let sender = sender(client);
        let options = sender.prepare(&call(), None).await.unwrap();
        let hash = sender.broadcast(&call(), &options).await.unwrap();

        let raw = sent.lock().unwrap().clone().unwrap();
        assert_eq!(hash, H256::from(keccak256(&raw)));
    }

    #[tokio::test]
    async fn test_nonce_too_low_is_not_retried() {
        let mut client = base_client(3, U256::exp10(18));
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(OpsError::Broadcast("nonce too low".to_string())));

        let sender = sender(client);
        let options = sender.prepare(&call(), None).await.unwrap();
        let err = sender.broadcast(&call(), &options).await.unwrap_err();
        assert!(matches!(err, OpsError::Nonce { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_rejection_sent_once() {
        let mut client = base_client(3, U256::exp10(18));
        client.expect_send_raw_transaction().times(1).returning(|_| {
            Err(OpsError::Broadcast(
                "max fee per gas less than block base fee".to_string(),
            ))
        });

        let sender = sender(client);
        let options = sender.prepare(&call(), None).await.unwrap();
        let err = sender.broadcast(&call(), &options).await.unwrap_err();
        assert!(matches!(err, OpsError::Broadcast(ref m) if m.contains("base fee")));
    }

    #[tokio::test]
    async fn test_node_insufficient_funds_reports_balance() {
        let mut client = base_client(3, U256::exp10(18));
        client.expect_send_raw_transaction().times(1).returning(|_| {
            Err(OpsError::Broadcast(
                "insufficient funds for gas * price + value".to_string(),
            ))
        });

        let sender = sender(client);
        let options = sender.prepare(&call(), None).await.unwrap();
        match sender.broadcast(&call(), &options).await.unwrap_err() {
            OpsError::InsufficientFunds { have, need, .. } => {
                assert_eq!(have, "1.000000000000000000");
                assert_eq!(need, "0.013500000000000000");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_up_returns_landed_receipt() {
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client
            .expect_nonce()
            .with(mockall::predicate::always(), mockall::predicate::eq(NonceTag::Latest))
            .returning(|_, _| Ok(8));
        client
            .expect_nonce()
            .with(mockall::predicate::always(), mockall::predicate::eq(NonceTag::Pending))
            .returning(|_, _| Ok(8));
        client
            .expect_transaction_receipt()
            .returning(|h| Ok(Some(receipt(h, 1))));
        client.expect_send_raw_transaction().times(0);

        let sender = sender(client);
        let previous = TxOptions {
            fees: Eip1559Fees {
                max_priority_fee_per_gas: gwei_u(45),
                max_fee_per_gas: gwei_u(135),
            },
            nonce: 7,
            gas_limit: U256::from(100_000u64),
            value: U256::zero(),
        };
        let hash = H256::repeat_byte(0x77);
        let result = sender.speed_up("transfer", &call(), &previous, hash).await.unwrap();
        assert_eq!(result.hash, hash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_up_bumps_pending_nonce() {
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client
            .expect_nonce()
            .with(mockall::predicate::always(), mockall::predicate::eq(NonceTag::Latest))
            .returning(|_, _| Ok(7));
        client
            .expect_nonce()
            .with(mockall::predicate::always(), mockall::predicate::eq(NonceTag::Pending))
            .returning(|_, _| Ok(8));
        client.expect_fee_quote().returning(|| Ok(FeeQuote::default()));
        client.expect_native_balance().returning(|_| Ok(U256::exp10(18)));
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        client
            .expect_transaction_receipt()
            .returning(|h| Ok(Some(receipt(h, 1))));

        let sender = sender(client);
        let previous = TxOptions {
            fees: Eip1559Fees {
                max_priority_fee_per_gas: gwei_u(40),
                max_fee_per_gas: gwei_u(100),
            },
            nonce: 7,
            gas_limit: U256::from(100_000u64),
            value: U256::zero(),
        };
        let result = sender
            .speed_up("transfer", &call(), &previous, H256::repeat_byte(0x01))
            .await
            .unwrap();
        assert_ne!(result.hash, H256::repeat_byte(0x01));
    }
}
