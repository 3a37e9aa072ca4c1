//! polygon-ops - stablecoin bridging, swapping and gas top-up on Polygon
//!
//! Each subcommand runs one flow against the configured accounts and prints
//! a JSON report. The process exits non-zero when the flow did not succeed.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ethers::types::{Address, H256};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

mod bridge;
mod chain;
mod config;
mod contracts;
mod error;
mod ops;
mod safe;
mod tx;
mod units;

use chain::ChainProvider;
use config::Settings;
use ops::buy_gas::BuyGasRequest;
use ops::claim_gas::ClaimGasRequest;
use ops::full_flow::FullFlowRequest;
use ops::speed_up::SpeedUpRequest;
use ops::swap::SwapRequest;
use ops::transfer::TransferRequest;
use ops::usdc_to_usdce::UsdcToUsdceRequest;
use ops::{OperationReport, OpsContext, TokenChoice};

#[derive(Parser, Debug)]
#[command(name = "polygon-ops", version, about)]
struct Cli {
    /// Configuration file (default: $POLYGON_OPS_CONFIG or config/default.toml)
    #[arg(long, global = true, env = "POLYGON_OPS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Native, USDC and USDC.e balances (default: the Safe)
    Balances {
        #[arg(long)]
        account: Option<Address>,
    },
    /// Quote USDC.e -> USDC on the v4 pool
    Quote {
        #[arg(long)]
        amount: String,
    },
    /// Bridge deposit address (default: the relayer account)
    BridgeAddress {
        #[arg(long)]
        wallet: Option<Address>,
    },
    /// ERC-20 transfer from the owner EOA or the Safe
    Send {
        #[arg(long)]
        amount: String,
        /// Recipient (default: the relayer account)
        #[arg(long)]
        to: Option<Address>,
        #[arg(long, value_enum, default_value = "usdc")]
        token: TokenChoice,
        #[arg(long)]
        via_safe: bool,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Buy POL with USDC.e
    BuyGas {
        /// USDC.e amount (default: bridge.buy_gas_amount)
        #[arg(long)]
        amount: Option<String>,
        #[arg(long)]
        via_safe: bool,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Swap USDC.e to USDC through the Universal Router
    Swap {
        #[arg(long)]
        amount: String,
        #[arg(long)]
        slippage_bps: Option<u32>,
        #[arg(long)]
        via_safe: bool,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Convert USDC to USDC.e from the Safe
    UsdcToUsdce {
        #[arg(long)]
        amount: String,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Relay a signed gas claim for the owner EOA
    ClaimGas {
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Bridge, buy gas and swap the remainder, all from the Safe
    FullFlow {
        #[arg(long)]
        bridge_amount: Option<String>,
        #[arg(long)]
        buy_gas_amount: Option<String>,
        #[arg(long)]
        slippage_bps: Option<u32>,
        #[arg(long)]
        fee_bps: Option<u32>,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
    /// Outbid a transaction reported with outcomeUnknown, reusing its nonce
    SpeedUp {
        #[arg(long)]
        hash: H256,
        #[arg(long)]
        bump_percent: Option<u64>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Balances { .. } => "balances",
            Command::Quote { .. } => "quote",
            Command::BridgeAddress { .. } => "bridge-address",
            Command::Send { .. } => "send",
            Command::BuyGas { .. } => "buy-gas",
            Command::Swap { .. } => "swap",
            Command::UsdcToUsdce { .. } => "usdc-to-usdce",
            Command::ClaimGas { .. } => "claim-gas",
            Command::FullFlow { .. } => "full-flow",
            Command::SpeedUp { .. } => "speed-up",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    init_logging();

    let name = cli.command.name();
    let report = match run(cli).await {
        Ok(report) => report,
        Err(e) => {
            error!("{} failed: {:#}", name, e);
            OperationReport {
                operation: name.to_string(),
                error: Some(format!("{:#}", e)),
                ..Default::default()
            }
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to render report: {}", e),
    }

    if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: Cli) -> Result<OperationReport> {
    info!("Starting polygon-ops v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load(cli.config.as_deref())?;
    info!(
        "Loaded configuration for {} (chain {}, {} RPC endpoint(s))",
        settings.chain.name,
        settings.chain.chain_id,
        settings.rpc_urls().len()
    );

    let provider = ChainProvider::new(&settings)?;
    let ctx = OpsContext::new(settings, Arc::new(provider));
    let name = cli.command.name();

    let outcome = match cli.command {
        Command::Balances { account } => ops::reads::balances(&ctx, account).await,
        Command::Quote { amount } => ops::reads::quote(&ctx, &amount).await,
        Command::BridgeAddress { wallet } => ops::reads::bridge_address(&ctx, wallet).await,
        Command::Send {
            amount,
            to,
            token,
            via_safe,
            bump_percent,
        } => {
            let request = TransferRequest {
                amount,
                to,
                token,
                via_safe,
                bump_percent,
            };
            ops::transfer::send(&ctx, &request).await
        }
        Command::BuyGas {
            amount,
            via_safe,
            bump_percent,
        } => {
            let request = BuyGasRequest {
                amount,
                via_safe,
                bump_percent,
            };
            ops::buy_gas::buy_gas(&ctx, &request).await
        }
        Command::Swap {
            amount,
            slippage_bps,
            via_safe,
            bump_percent,
        } => {
            let request = SwapRequest {
                amount,
                slippage_bps,
                via_safe,
                bump_percent,
            };
            ops::swap::swap(&ctx, &request).await
        }
        Command::UsdcToUsdce { amount, bump_percent } => {
            let request = UsdcToUsdceRequest { amount, bump_percent };
            ops::usdc_to_usdce::usdc_to_usdce(&ctx, &request).await
        }
        Command::ClaimGas { bump_percent } => {
            ops::claim_gas::claim_gas(&ctx, &ClaimGasRequest { bump_percent }).await
        }
        Command::FullFlow {
            bridge_amount,
            buy_gas_amount,
            slippage_bps,
            fee_bps,
            bump_percent,
        } => {
            let request = FullFlowRequest {
                bridge_amount,
                buy_gas_amount,
                slippage_bps,
                fee_bps,
                bump_percent,
            };
            ops::full_flow::full_flow(&ctx, &request).await
        }
        Command::SpeedUp { hash, bump_percent } => {
            ops::speed_up::speed_up(&ctx, &SpeedUpRequest { hash, bump_percent }).await
        }
    };

    // Operation errors become a failed report rather than an early exit
    Ok(match outcome {
        Ok(report) => report,
        Err(e) => OperationReport::failed(name, &e).with_explorer(&ctx.settings),
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,polygon_ops=debug,hyper=warn,reqwest=warn"));

    // Reports go to stdout, so logs go to stderr
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
