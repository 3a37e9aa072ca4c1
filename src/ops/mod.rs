//! Operations behind the CLI subcommands
//!
//! Every operation takes an [`OpsContext`] holding validated settings and the
//! chain client, and produces an [`OperationReport`].

pub mod buy_gas;
pub mod claim_gas;
pub mod full_flow;
pub mod reads;
pub mod speed_up;
pub mod swap;
pub mod transfer;
pub mod usdc_to_usdce;

use crate::chain::ChainClient;
use crate::config::{Settings, TokenConfig};
use crate::contracts::token_balance;
use crate::error::{OpsError, OpsResult};
use crate::safe::{SafeExecutor, SafeTxParams};
use crate::tx::{NonceAllocator, SequenceError, StepOutcome, SubmissionResult, TransactionSender};
use crate::units::format_amount;

use ethers::types::{Address, H256, U256};
use ethers::utils::format_ether;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Token selector for transfer-style commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TokenChoice {
    Usdc,
    UsdcE,
}

/// Shared state for one invocation
pub struct OpsContext {
    pub settings: Settings,
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
}

impl OpsContext {
    pub fn new(settings: Settings, client: Arc<dyn ChainClient>) -> Self {
        Self {
            settings,
            client,
            nonces: Arc::new(NonceAllocator::new()),
        }
    }

    pub fn client(&self) -> &dyn ChainClient {
        self.client.as_ref()
    }

    /// Sender for the owner EOA (`PRIVATE_KEY_EOA`)
    pub fn eoa_sender(&self, bump_percent: Option<u64>) -> OpsResult<TransactionSender> {
        let wallet = self.settings.require_eoa_wallet()?;
        TransactionSender::from_settings(
            self.client.clone(),
            wallet,
            self.nonces.clone(),
            &self.settings,
            bump_percent,
        )
    }

    /// Sender for the relayer EOA (`PRIVATE_KEY_THIRD_WEB`)
    pub fn relayer_sender(&self, bump_percent: Option<u64>) -> OpsResult<TransactionSender> {
        let wallet = self.settings.require_relayer_wallet()?;
        TransactionSender::from_settings(
            self.client.clone(),
            wallet,
            self.nonces.clone(),
            &self.settings,
            bump_percent,
        )
    }

    pub fn safe_params(&self) -> SafeTxParams {
        SafeTxParams::from_settings(&self.settings)
    }

    /// Executor for the configured Safe, owned by `owner`
    pub fn safe_executor<'a>(
        &self,
        owner: &'a TransactionSender,
        params: SafeTxParams,
    ) -> OpsResult<SafeExecutor<'a>> {
        let safe = self.settings.require_safe_address()?;
        let multisend = self
            .settings
            .require_contract("multisend_call_only", self.settings.contracts.multisend_call_only)?;
        Ok(SafeExecutor::new(
            owner,
            safe,
            multisend,
            params,
            self.settings.gas.limits.safe_exec,
        ))
    }

    pub fn usdc(&self) -> &TokenConfig {
        &self.settings.tokens.usdc
    }

    pub fn usdc_e(&self) -> &TokenConfig {
        &self.settings.tokens.usdc_e
    }

    pub fn token(&self, choice: TokenChoice) -> &TokenConfig {
        match choice {
            TokenChoice::Usdc => self.usdc(),
            TokenChoice::UsdcE => self.usdc_e(),
        }
    }

    /// Expiry for approvals and signed claims
    pub fn deadline(&self) -> u64 {
        unix_now() + self.settings.policy.approval_deadline_secs
    }

    /// Fail before submitting anything if `holder` has less than `need`
    pub async fn require_token_balance(
        &self,
        token: &TokenConfig,
        holder: Address,
        need: U256,
    ) -> OpsResult<U256> {
        let have = token_balance(self.client(), token.address, holder).await?;
        if have < need {
            return Err(OpsError::InsufficientFunds {
                account: holder,
                asset: token.symbol.clone(),
                have: format_amount(have, token.decimals),
                need: format_amount(need, token.decimals),
            });
        }
        Ok(have)
    }
}

pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Structured result printed for every command
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_gas_spent_wei: Option<String>,
    #[serde(rename = "totalGasSpentPOL", skip_serializing_if = "Option::is_none")]
    pub total_gas_spent_pol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The last transaction may still confirm; do not resubmit blindly
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub outcome_unknown: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl OperationReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Successful read-only command
    pub fn read_only(operation: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            success: true,
            details,
            ..Self::new(operation)
        }
    }

    /// Successful submission(s); the last one is the reported hash
    pub fn submitted<'a>(
        operation: impl Into<String>,
        results: impl IntoIterator<Item = &'a SubmissionResult>,
    ) -> Self {
        let mut report = Self::new(operation);
        report.success = true;
        report.add_results(results);
        report
    }

    /// Successful sequence
    pub fn from_steps(operation: impl Into<String>, steps: Vec<StepOutcome>) -> Self {
        let mut report = Self::submitted(operation, steps.iter().filter_map(StepOutcome::result));
        report.steps = steps;
        report
    }

    /// Failed command
    pub fn failed(operation: impl Into<String>, err: &OpsError) -> Self {
        let mut report = Self::new(operation);
        report.record_error(err);
        report
    }

    /// Sequence aborted part-way: completed steps are kept for reconciliation
    pub fn from_sequence_error(operation: impl Into<String>, err: SequenceError) -> Self {
        let mut report = Self::new(operation);
        report.add_results(err.completed.iter().filter_map(StepOutcome::result));
        report.steps = err.completed;
        report.error = Some(format!("step {}: {}", err.failed_step, err.source));
        report.record_error_flags(&err.source);
        report
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_explorer(mut self, settings: &Settings) -> Self {
        self.explorer_url = self.transaction_hash.map(|h| settings.explorer_link(h));
        self
    }

    fn add_results<'a>(&mut self, results: impl IntoIterator<Item = &'a SubmissionResult>) {
        let mut gas_used = U256::zero();
        let mut total_fee = U256::zero();
        let mut any = false;

        for result in results {
            any = true;
            self.transaction_hash = Some(result.hash);
            gas_used = gas_used.saturating_add(result.gas_used.unwrap_or_default());
            total_fee = total_fee.saturating_add(result.total_fee().unwrap_or_default());
        }

        if any {
            self.gas_used = Some(gas_used.to_string());
            self.total_gas_spent_wei = Some(total_fee.to_string());
            self.total_gas_spent_pol = Some(format_ether(total_fee));
        }
    }

    fn record_error(&mut self, err: &OpsError) {
        self.error = Some(err.to_string());
        self.record_error_flags(err);
    }

    fn record_error_flags(&mut self, err: &OpsError) {
        self.success = false;
        self.outcome_unknown = err.is_unknown_outcome();
        if let OpsError::ConfirmationTimeout { hash, .. } | OpsError::OnChainRevert { hash, .. } = err {
            self.transaction_hash = Some(*hash);
        }
        error!("{} failed: {}", self.operation, err);
    }
}
