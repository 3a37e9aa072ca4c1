//! Deposit-address bridge (USDC -> USDC.e)
//!
//! The bridge service hands out a per-wallet deposit address; native USDC
//! sent there is credited to the wallet as USDC.e some time later.

use crate::chain::ChainClient;
use crate::config::{parse_address, BridgeConfig};
use crate::contracts::token_balance;
use crate::error::{OpsError, OpsResult};
use crate::tx::poll::{poll_until, PollOutcome, PollSchedule};

use ethers::types::{Address, U256};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Deposit addresses per network family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddresses {
    pub evm: Option<String>,
    pub svm: Option<String>,
    pub btc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepositResponse {
    #[serde(default)]
    address: DepositAddresses,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct DepositRequest<'a> {
    address: &'a str,
}

impl DepositAddresses {
    /// EVM deposit address, required for Polygon flows
    pub fn evm_address(&self) -> OpsResult<Address> {
        let evm = self.evm.as_deref().ok_or_else(|| OpsError::ExternalService {
            status: 200,
            message: "bridge response has no EVM deposit address".to_string(),
        })?;
        parse_address("address.evm", "bridge response", evm).map_err(|_| OpsError::ExternalService {
            status: 200,
            message: format!("bridge returned an invalid EVM address: {}", evm),
        })
    }
}

/// Parse a deposit endpoint response
pub fn parse_deposit_response(status: StatusCode, body: &str) -> OpsResult<DepositAddresses> {
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
        return Err(OpsError::ExternalService {
            status: status.as_u16(),
            message: format!("bridge deposit failed: {}", message),
        });
    }

    let parsed: DepositResponse = serde_json::from_str(body).map_err(|e| OpsError::ExternalService {
        status: status.as_u16(),
        message: format!("malformed bridge response: {}", e),
    })?;
    Ok(parsed.address)
}

/// HTTP client for the deposit endpoint
pub struct BridgeClient {
    http: reqwest::Client,
    deposit_url: String,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig) -> OpsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            deposit_url: config.deposit_url.clone(),
        })
    }

    /// Request the deposit addresses for `wallet`
    pub async fn deposit_addresses(&self, wallet: Address) -> OpsResult<DepositAddresses> {
        let address = format!("{:?}", wallet);
        debug!("Requesting bridge deposit address for {}", address);

        let response = self
            .http
            .post(&self.deposit_url)
            .json(&DepositRequest { address: &address })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_deposit_response(status, &body)
    }

    /// EVM deposit address for `wallet`
    pub async fn deposit_address(&self, wallet: Address) -> OpsResult<Address> {
        let deposit = self.deposit_addresses(wallet).await?.evm_address()?;
        info!("Bridge deposit address for {:?}: {:?}", wallet, deposit);
        Ok(deposit)
    }
}

/// The bridge ignores deposits below its minimum
pub fn ensure_min_amount(amount: U256, minimum: U256, symbol: &str, decimals: u8) -> OpsResult<()> {
    if amount < minimum {
        return Err(OpsError::InvalidAmount {
            input: crate::units::format_amount(amount, decimals),
            message: format!(
                "bridge minimum is {} {}",
                crate::units::format_amount(minimum, decimals),
                symbol
            ),
        });
    }
    Ok(())
}

/// Poll `holder`'s `token` balance until it rises above `before`.
/// Returns the new balance.
pub async fn wait_for_credit(
    client: &dyn ChainClient,
    token: Address,
    holder: Address,
    before: U256,
    schedule: PollSchedule,
) -> OpsResult<U256> {
    info!(
        "Waiting up to {}s for bridge credit to {:?}",
        schedule.deadline.as_secs(),
        holder
    );

    let outcome = poll_until("bridge credit", schedule, move || async move {
        let balance = token_balance(client, token, holder).await?;
        Ok((balance > before).then_some(balance))
    })
    .await?;

    match outcome {
        PollOutcome::Ready(balance) => {
            info!("Bridge credited {:?}: balance {} -> {}", holder, before, balance);
            Ok(balance)
        }
        PollOutcome::TimedOut { elapsed } => Err(OpsError::BridgeCreditTimeout { holder, elapsed }),
    }
}
