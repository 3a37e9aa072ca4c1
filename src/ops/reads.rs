//! Read-only commands

use super::{OperationReport, OpsContext};
use crate::bridge::BridgeClient;
use crate::contracts::router::{quote_exact_input_single, PoolKey};
use crate::contracts::token_balance;
use crate::error::OpsResult;
use crate::units::{format_amount, parse_amount};

use ethers::types::Address;
use ethers::utils::format_ether;
use serde_json::json;
use tracing::info;

/// Native, USDC and USDC.e balances of `account` (default: the Safe)
pub async fn balances(ctx: &OpsContext, account: Option<Address>) -> OpsResult<OperationReport> {
    let account = match account {
        Some(account) => account,
        None => ctx.settings.require_safe_address()?,
    };
    let (usdc, usdc_e) = (ctx.usdc(), ctx.usdc_e());
    let client = ctx.client();

    let (native, usdc_balance, usdc_e_balance) = tokio::try_join!(
        client.native_balance(account),
        token_balance(client, usdc.address, account),
        token_balance(client, usdc_e.address, account),
    )?;

    info!(
        "{:?}: {} {}, {} {}, {} {}",
        account,
        format_ether(native),
        ctx.settings.tokens.native_symbol,
        format_amount(usdc_balance, usdc.decimals),
        usdc.symbol,
        format_amount(usdc_e_balance, usdc_e.decimals),
        usdc_e.symbol
    );

    Ok(OperationReport::read_only(
        "balances",
        json!({
            "account": account,
            "balances": {
                ctx.settings.tokens.native_symbol.clone(): format_ether(native),
                usdc.symbol.clone(): format_amount(usdc_balance, usdc.decimals),
                usdc_e.symbol.clone(): format_amount(usdc_e_balance, usdc_e.decimals),
            },
            "raw": {
                "native": native.to_string(),
                "usdc": usdc_balance.to_string(),
                "usdcE": usdc_e_balance.to_string(),
            }
        }),
    ))
}

/// USDC.e -> USDC quote for `amount`
pub async fn quote(ctx: &OpsContext, amount: &str) -> OpsResult<OperationReport> {
    let (usdc, usdc_e) = (ctx.usdc(), ctx.usdc_e());
    let amount_in = parse_amount(amount, usdc_e.decimals)?;
    let quoter = ctx
        .settings
        .require_contract("v4_quoter", ctx.settings.contracts.v4_quoter)?;

    let (pool_key, zero_for_one) = usdc_e_to_usdc_pool(ctx);
    let amount_out = quote_exact_input_single(ctx.client(), quoter, pool_key, zero_for_one, amount_in).await?;

    info!(
        "Quote: {} {} -> {} {}",
        format_amount(amount_in, usdc_e.decimals),
        usdc_e.symbol,
        format_amount(amount_out, usdc.decimals),
        usdc.symbol
    );

    Ok(OperationReport::read_only(
        "quote",
        json!({
            "amountIn": format_amount(amount_in, usdc_e.decimals),
            "amountOut": format_amount(amount_out, usdc.decimals),
            "amountOutRaw": amount_out.to_string(),
        }),
    ))
}

/// Bridge deposit address for `wallet` (default: the relayer account)
pub async fn bridge_address(ctx: &OpsContext, wallet: Option<Address>) -> OpsResult<OperationReport> {
    let wallet = match wallet {
        Some(wallet) => wallet,
        None => ctx.settings.require_relayer_address()?,
    };
    let bridge = BridgeClient::new(&ctx.settings.bridge)?;
    let addresses = bridge.deposit_addresses(wallet).await?;
    let evm = addresses.evm_address()?;

    Ok(OperationReport::read_only(
        "bridge-address",
        json!({
            "wallet": wallet,
            "depositAddress": evm,
            "addresses": addresses,
        }),
    ))
}

/// Pool key sorted by address, and the swap direction for USDC.e in
pub(crate) fn usdc_e_to_usdc_pool(ctx: &OpsContext) -> (PoolKey, bool) {
    let (usdc, usdc_e) = (ctx.usdc().address, ctx.usdc_e().address);
    let (currency0, currency1) = if usdc_e < usdc { (usdc_e, usdc) } else { (usdc, usdc_e) };
    (
        PoolKey::new(currency0, currency1, &ctx.settings.pool),
        currency0 == usdc_e,
    )
}
