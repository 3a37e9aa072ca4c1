//! Configuration management for polygon-ops
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Secrets and account addresses are referenced from the environment as
//! `${VAR}` and checked by the `require_*` accessors before any network call.

use crate::error::{OpsError, OpsResult};
use crate::tx::GasPolicy;

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub chain: ChainConfig,
    pub gas: GasConfig,
    pub timeouts: TimeoutConfig,
    pub policy: PolicyConfig,
    pub tokens: TokensConfig,
    pub contracts: ContractsConfig,
    pub pool: PoolConfig,
    pub safe: SafeConfig,
    pub bridge: BridgeConfig,
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub receipt_poll_interval_ms: u64,
    pub explorer_tx_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    pub minimum_priority_fee_gwei: u64,
    pub bump_percent: u64,
    pub replacement_bump_percent: u64,
    pub limits: GasLimits,
}

/// Gas-limit hints per call kind
#[derive(Debug, Clone, Deserialize)]
pub struct GasLimits {
    pub transfer: u64,
    pub approve: u64,
    pub buy_gas: u64,
    pub swap: u64,
    pub claim_gas: u64,
    pub usdc_to_usdce: u64,
    pub safe_exec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    pub confirmation_secs: u64,
    pub pending_drain_secs: u64,
    pub pending_poll_interval_ms: u64,
    pub broadcast_retries: u32,
    pub retry_delay_ms: u64,
}

/// Caller-tunable policy; CLI flags override these per run
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub slippage_bps: u32,
    pub protocol_fee_bps: u32,
    pub approval_deadline_secs: u64,
    pub wait_for_pending_drain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    pub usdc: TokenConfig,
    pub usdc_e: TokenConfig,
    pub native_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    pub buy_gas: Address,
    pub buy_usdce: Address,
    pub send_gas: Address,
    pub permit2: Address,
    pub universal_router: Address,
    pub v4_quoter: Address,
    pub multisend_call_only: Address,
}

/// Uniswap v4 pool used for USDC.e -> USDC
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub fee: u32,
    pub tick_spacing: i32,
    pub hooks: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafeConfig {
    pub safe_tx_gas: u64,
    /// Lower safeTxGas for the approve + buyGas batch
    #[serde(default = "default_buy_gas_safe_tx_gas")]
    pub buy_gas_safe_tx_gas: u64,
    pub gas_price_wei: String,
}

fn default_buy_gas_safe_tx_gas() -> u64 {
    350_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub deposit_url: String,
    pub min_amount: String,
    pub bridge_amount: String,
    pub buy_gas_amount: String,
    pub credit_timeout_secs: u64,
    pub credit_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

/// Accounts and secrets; empty strings mean "not provided"
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    #[serde(default)]
    pub eoa_private_key: String,
    #[serde(default)]
    pub relayer_private_key: String,
    #[serde(default)]
    pub safe_address: String,
    #[serde(default)]
    pub relayer_address: String,
    #[serde(default)]
    pub eoa_address: String,
    #[serde(default)]
    pub fee_recipient: String,
}

impl Settings {
    /// Load settings from the configured file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(|| {
            env::var("POLYGON_OPS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/default.toml"))
        });

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> OpsResult<()> {
        let rpc_urls = self.rpc_urls();
        if rpc_urls.is_empty() {
            return Err(OpsError::config("chain.rpc_urls", "no RPC URL configured"));
        }

        for url in &rpc_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(OpsError::config(
                    "chain.rpc_urls",
                    format!("{} is not an http(s) URL", url),
                ));
            }
        }

        self.gas_policy()?;

        if self.gas.replacement_bump_percent < 110 {
            return Err(OpsError::config(
                "gas.replacement_bump_percent",
                "nodes reject replacements priced below +10%",
            ));
        }

        if self.policy.slippage_bps >= 10_000 {
            return Err(OpsError::config("policy.slippage_bps", "must be below 10000"));
        }

        if self.policy.protocol_fee_bps >= 10_000 {
            return Err(OpsError::config("policy.protocol_fee_bps", "must be below 10000"));
        }

        if self.timeouts.confirmation_secs == 0 {
            return Err(OpsError::config("timeouts.confirmation_secs", "must be positive"));
        }

        for (field, interval) in [
            ("chain.receipt_poll_interval_ms", self.chain.receipt_poll_interval_ms),
            ("timeouts.pending_poll_interval_ms", self.timeouts.pending_poll_interval_ms),
            ("bridge.credit_poll_interval_ms", self.bridge.credit_poll_interval_ms),
        ] {
            if interval == 0 {
                return Err(OpsError::config(field, "poll interval must be positive"));
            }
        }

        U256::from_dec_str(&self.safe.gas_price_wei)
            .map_err(|e| OpsError::config("safe.gas_price_wei", e.to_string()))?;

        Ok(())
    }

    /// RPC URLs with blanks (unset env substitutions) removed
    pub fn rpc_urls(&self) -> Vec<String> {
        self.chain
            .rpc_urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }

    /// Gas policy derived from the `[gas]` table
    pub fn gas_policy(&self) -> OpsResult<GasPolicy> {
        GasPolicy::new(
            U256::from(self.gas.minimum_priority_fee_gwei) * U256::exp10(9),
            self.gas.bump_percent,
        )
    }

    /// Gas policy with the bump overridden by the caller
    pub fn gas_policy_with_bump(&self, bump_percent: Option<u64>) -> OpsResult<GasPolicy> {
        match bump_percent {
            Some(bump) => GasPolicy::new(
                U256::from(self.gas.minimum_priority_fee_gwei) * U256::exp10(9),
                bump,
            ),
            None => self.gas_policy(),
        }
    }

    pub fn safe_gas_price(&self) -> U256 {
        U256::from_dec_str(&self.safe.gas_price_wei).unwrap_or_default()
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.confirmation_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chain.receipt_poll_interval_ms)
    }

    /// Owner EOA key (signs Safe transactions and EOA flows)
    pub fn require_eoa_wallet(&self) -> OpsResult<LocalWallet> {
        parse_wallet("accounts.eoa_private_key", "PRIVATE_KEY_EOA", &self.accounts.eoa_private_key)
            .map(|w| w.with_chain_id(self.chain.chain_id))
    }

    /// Relayer EOA key (pays gas for claims)
    pub fn require_relayer_wallet(&self) -> OpsResult<LocalWallet> {
        parse_wallet(
            "accounts.relayer_private_key",
            "PRIVATE_KEY_THIRD_WEB",
            &self.accounts.relayer_private_key,
        )
        .map(|w| w.with_chain_id(self.chain.chain_id))
    }

    pub fn require_safe_address(&self) -> OpsResult<Address> {
        parse_address("accounts.safe_address", "ACCOUNT_ADD_SAFE", &self.accounts.safe_address)
    }

    pub fn require_relayer_address(&self) -> OpsResult<Address> {
        parse_address(
            "accounts.relayer_address",
            "ACCOUNT_ADD_THIRD_WEB",
            &self.accounts.relayer_address,
        )
    }

    pub fn require_eoa_address(&self) -> OpsResult<Address> {
        parse_address("accounts.eoa_address", "ACCOUNT_ADD_EOA", &self.accounts.eoa_address)
    }

    pub fn require_fee_recipient(&self) -> OpsResult<Address> {
        parse_address(
            "accounts.fee_recipient",
            "FEE_RECIPIENT_ADDRESS",
            &self.accounts.fee_recipient,
        )
    }

    /// Contract address that must not be left as the zero placeholder
    pub fn require_contract(&self, field: &str, address: Address) -> OpsResult<Address> {
        if address == Address::zero() {
            return Err(OpsError::config(
                format!("contracts.{}", field),
                "contract address not configured",
            ));
        }
        Ok(address)
    }

    pub fn explorer_link(&self, hash: ethers::types::H256) -> String {
        format!("{}{:?}", self.chain.explorer_tx_url, hash)
    }
}

fn parse_wallet(field: &str, env_name: &str, value: &str) -> OpsResult<LocalWallet> {
    let value = value.trim();
    if value.is_empty() {
        return Err(OpsError::config(field, format!("{} is not set", env_name)));
    }
    value
        .strip_prefix("0x")
        .unwrap_or(value)
        .parse::<LocalWallet>()
        .map_err(|e| OpsError::config(field, format!("invalid private key: {}", e)))
}

/// Parse a `0x`-prefixed 20-byte address
pub fn parse_address(field: &str, env_name: &str, value: &str) -> OpsResult<Address> {
    let value = value.trim();
    if value.is_empty() {
        return Err(OpsError::config(field, format!("{} is not set", env_name)));
    }
    let is_hex = value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex {
        return Err(OpsError::config(field, format!("{} is not a valid address", value)));
    }
    value
        .parse::<Address>()
        .map_err(|e| OpsError::config(field, e.to_string()))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
