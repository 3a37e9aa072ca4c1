//! Buy native gas with USDC.e through the BuyGas contract

use super::{OperationReport, OpsContext};
use crate::contracts::{approve_data, buy_gas_data, token_allowance};
use crate::error::OpsResult;
use crate::safe::{MetaTransaction, SafeBatch};
use crate::tx::{run_sequence, ConditionalStep, Precondition, Step, TxCall};
use crate::units::{format_amount, parse_amount};

use ethers::types::{Address, U256};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BuyGasRequest {
    /// USDC.e amount; defaults to `bridge.buy_gas_amount`
    pub amount: Option<String>,
    pub via_safe: bool,
    pub bump_percent: Option<u64>,
}

pub async fn buy_gas(ctx: &OpsContext, request: &BuyGasRequest) -> OpsResult<OperationReport> {
    let token = ctx.usdc_e().clone();
    let amount_str = request
        .amount
        .clone()
        .unwrap_or_else(|| ctx.settings.bridge.buy_gas_amount.clone());
    let amount = parse_amount(&amount_str, token.decimals)?;
    let buy_gas = ctx
        .settings
        .require_contract("buy_gas", ctx.settings.contracts.buy_gas)?;
    let sender = ctx.eoa_sender(request.bump_percent)?;

    let details = json!({
        "token": token.symbol,
        "amount": format_amount(amount, token.decimals),
        "viaSafe": request.via_safe,
    });

    if request.via_safe {
        let params = ctx
            .safe_params()
            .with_safe_tx_gas(ctx.settings.safe.buy_gas_safe_tx_gas);
        let executor = ctx.safe_executor(&sender, params)?;
        let batch = buy_gas_batch(ctx, executor.address(), amount).await?;

        let result = executor.execute("approve + buyGas", batch).await?;
        return Ok(OperationReport::submitted("buy-gas", [&result])
            .with_explorer(&ctx.settings)
            .with_details(details));
    }

    let owner = sender.address();
    ctx.require_token_balance(&token, owner, amount).await?;
    info!("Buying gas with {} {} from {:?}", amount_str, token.symbol, owner);

    let limits = &ctx.settings.gas.limits;
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(ConditionalStep::new(
            "approve USDC.e for BuyGas",
            Precondition::AllowanceBelow {
                token: token.address,
                owner,
                spender: buy_gas,
                amount,
            },
            TxCall::new(token.address, approve_data(buy_gas, U256::MAX), limits.approve),
        )),
        Box::new(ConditionalStep::always(
            "buyGas",
            TxCall::new(buy_gas, buy_gas_data(amount), limits.buy_gas),
        )),
    ];

    let report = match run_sequence(&sender, &steps).await {
        Ok(outcomes) => OperationReport::from_steps("buy-gas", outcomes),
        Err(e) => OperationReport::from_sequence_error("buy-gas", e),
    };
    Ok(report.with_explorer(&ctx.settings).with_details(details))
}

/// Approve (if the Safe's allowance is short) and `buyGas(amount)` as one batch
pub(crate) async fn buy_gas_batch(ctx: &OpsContext, safe: Address, amount: U256) -> OpsResult<SafeBatch> {
    let token = ctx.usdc_e();
    let buy_gas = ctx
        .settings
        .require_contract("buy_gas", ctx.settings.contracts.buy_gas)?;

    ctx.require_token_balance(token, safe, amount).await?;
    let allowance = token_allowance(ctx.client(), token.address, safe, buy_gas).await?;
    let needs_approval = allowance < amount;

    info!(
        "Safe {:?} buying gas with {} {} (approval {})",
        safe,
        format_amount(amount, token.decimals),
        token.symbol,
        if needs_approval { "needed" } else { "sufficient" }
    );

    Ok(SafeBatch::new()
        .push_if(
            needs_approval,
            MetaTransaction::call(token.address, approve_data(buy_gas, U256::MAX)),
        )
        .push(MetaTransaction::call(buy_gas, buy_gas_data(amount))))
}
