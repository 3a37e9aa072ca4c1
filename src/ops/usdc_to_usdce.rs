//! USDC -> USDC.e through the BuyUsdcE contract, executed by the Safe

use super::{OperationReport, OpsContext};
use crate::contracts::{approve_data, swap_usdc_for_usdce_data, token_allowance};
use crate::error::OpsResult;
use crate::safe::{MetaTransaction, SafeBatch};
use crate::units::{format_amount, parse_amount};

use ethers::types::{Address, U256};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct UsdcToUsdceRequest {
    pub amount: String,
    pub bump_percent: Option<u64>,
}

pub async fn usdc_to_usdce(ctx: &OpsContext, request: &UsdcToUsdceRequest) -> OpsResult<OperationReport> {
    let usdc = ctx.usdc().clone();
    let amount = parse_amount(&request.amount, usdc.decimals)?;
    let sender = ctx.eoa_sender(request.bump_percent)?;
    let executor = ctx.safe_executor(&sender, ctx.safe_params())?;

    let batch = conversion_batch(ctx, executor.address(), amount).await?;
    let result = executor.execute("approve + swapUsdcForUsdCe", batch).await?;

    Ok(OperationReport::submitted("usdc-to-usdce", [&result])
        .with_explorer(&ctx.settings)
        .with_details(json!({
            "amount": format_amount(amount, usdc.decimals),
            "from": usdc.symbol,
            "to": ctx.usdc_e().symbol,
        })))
}

async fn conversion_batch(ctx: &OpsContext, safe: Address, amount: U256) -> OpsResult<SafeBatch> {
    let usdc = ctx.usdc();
    let converter = ctx
        .settings
        .require_contract("buy_usdce", ctx.settings.contracts.buy_usdce)?;

    ctx.require_token_balance(usdc, safe, amount).await?;
    let allowance = token_allowance(ctx.client(), usdc.address, safe, converter).await?;

    info!(
        "Safe {:?} converting {} {} (allowance {})",
        safe,
        format_amount(amount, usdc.decimals),
        usdc.symbol,
        format_amount(allowance, usdc.decimals)
    );

    Ok(SafeBatch::new()
        .push_if(
            allowance < amount,
            MetaTransaction::call(usdc.address, approve_data(converter, U256::MAX)),
        )
        .push(MetaTransaction::call(converter, swap_usdc_for_usdce_data(amount))))
}
