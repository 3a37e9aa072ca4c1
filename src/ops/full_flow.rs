//! Bridge USDC, buy gas, swap the rest back to USDC; all through the Safe
//!
//! 1. transfer USDC to the bridge deposit address and wait for the USDC.e
//!    credit
//! 2. approve (if needed) and `buyGas` with a fixed USDC.e amount
//! 3. protocol fee transfer, approvals (if needed) and router execute in one
//!    batch for the remaining USDC.e

use super::buy_gas::buy_gas_batch;
use super::swap::SwapPlan;
use super::{OperationReport, OpsContext};
use crate::bridge::{ensure_min_amount, wait_for_credit, BridgeClient};
use crate::contracts::{token_balance, transfer_data};
use crate::error::{OpsError, OpsResult};
use crate::safe::{MetaTransaction, SafeBatch, SafeExecutor};
use crate::tx::poll::PollSchedule;
use crate::tx::{SequenceError, StepOutcome, SubmissionResult};
use crate::units::{bps_of, format_amount, parse_amount};

use ethers::types::{Address, U256};
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct FullFlowRequest {
    /// USDC sent to the bridge; defaults to `bridge.bridge_amount`
    pub bridge_amount: Option<String>,
    /// USDC.e spent on gas; defaults to `bridge.buy_gas_amount`
    pub buy_gas_amount: Option<String>,
    pub slippage_bps: Option<u32>,
    pub fee_bps: Option<u32>,
    pub bump_percent: Option<u64>,
}

/// Split `total` into `(fee, amount_to_swap)`
pub fn split_fee(total: U256, fee_bps: u32) -> OpsResult<(U256, U256)> {
    let fee = bps_of(total, fee_bps);
    let swap = total - fee;
    if swap.is_zero() {
        return Err(OpsError::InvalidAmount {
            input: total.to_string(),
            message: format!("nothing left to swap after a {} bps fee", fee_bps),
        });
    }
    Ok((fee, swap))
}

/// Balances the flow needs before anything is sent
fn check_starting_balances(
    usdc_balance: U256,
    usdc_e_balance: U256,
    bridge_amount: U256,
    buy_gas_amount: U256,
    safe: Address,
    ctx: &OpsContext,
) -> OpsResult<()> {
    let (usdc, usdc_e) = (ctx.usdc(), ctx.usdc_e());
    if usdc_balance < bridge_amount {
        return Err(OpsError::InsufficientFunds {
            account: safe,
            asset: usdc.symbol.clone(),
            have: format_amount(usdc_balance, usdc.decimals),
            need: format_amount(bridge_amount, usdc.decimals),
        });
    }
    // The bridge credits 1:1, so this is what step 2 will see at best
    let expected = usdc_e_balance + bridge_amount;
    if expected < buy_gas_amount {
        return Err(OpsError::InsufficientFunds {
            account: safe,
            asset: usdc_e.symbol.clone(),
            have: format_amount(expected, usdc_e.decimals),
            need: format_amount(buy_gas_amount, usdc_e.decimals),
        });
    }
    Ok(())
}

fn aborted(completed: Vec<StepOutcome>, failed_step: &str, source: OpsError) -> OperationReport {
    OperationReport::from_sequence_error(
        "full-flow",
        SequenceError {
            failed_step: failed_step.to_string(),
            completed,
            source,
        },
    )
}

fn submitted(label: &str, result: SubmissionResult) -> StepOutcome {
    StepOutcome::Submitted {
        label: label.to_string(),
        result,
    }
}

async fn buy_gas_step(
    ctx: &OpsContext,
    executor: &SafeExecutor<'_>,
    amount: U256,
) -> OpsResult<SubmissionResult> {
    let batch = buy_gas_batch(ctx, executor.address(), amount).await?;
    executor.execute("approve + buyGas", batch).await
}

async fn swap_step(
    ctx: &OpsContext,
    executor: &SafeExecutor<'_>,
    remaining: U256,
    fee_bps: u32,
    fee_recipient: Option<Address>,
    slippage_bps: u32,
) -> OpsResult<(SubmissionResult, U256, SwapPlan)> {
    let usdc_e = ctx.usdc_e();
    let (fee, amount_to_swap) = split_fee(remaining, fee_bps)?;
    info!(
        "Step 3: swapping {} {} (fee {})",
        format_amount(amount_to_swap, usdc_e.decimals),
        usdc_e.symbol,
        format_amount(fee, usdc_e.decimals)
    );

    let batch = match fee_recipient {
        Some(recipient) if !fee.is_zero() => SafeBatch::new().push(MetaTransaction::call(
            usdc_e.address,
            transfer_data(recipient, fee),
        )),
        _ => SafeBatch::new(),
    };

    let plan = SwapPlan::quote(ctx, amount_to_swap, slippage_bps).await?;
    let batch = plan.append_to_batch(ctx, executor.address(), batch).await?;
    let result = executor.execute("fee + swap", batch).await?;
    Ok((result, fee, plan))
}

pub async fn full_flow(ctx: &OpsContext, request: &FullFlowRequest) -> OpsResult<OperationReport> {
    let settings = &ctx.settings;
    let (usdc, usdc_e) = (ctx.usdc().clone(), ctx.usdc_e().clone());

    let bridge_amount = parse_amount(
        request.bridge_amount.as_deref().unwrap_or(&settings.bridge.bridge_amount),
        usdc.decimals,
    )?;
    let buy_gas_amount = parse_amount(
        request.buy_gas_amount.as_deref().unwrap_or(&settings.bridge.buy_gas_amount),
        usdc_e.decimals,
    )?;
    let min_bridge = parse_amount(&settings.bridge.min_amount, usdc.decimals)?;
    ensure_min_amount(bridge_amount, min_bridge, &usdc.symbol, usdc.decimals)?;

    let slippage_bps = request.slippage_bps.unwrap_or(settings.policy.slippage_bps);
    let fee_bps = request.fee_bps.unwrap_or(settings.policy.protocol_fee_bps);
    if fee_bps >= 10_000 {
        return Err(OpsError::InvalidAmount {
            input: fee_bps.to_string(),
            message: "fee must be below 10000 bps".to_string(),
        });
    }
    let fee_recipient = if fee_bps > 0 {
        Some(settings.require_fee_recipient()?)
    } else {
        None
    };

    let owner = ctx.eoa_sender(request.bump_percent)?;
    let executor = ctx.safe_executor(&owner, ctx.safe_params())?;
    let buy_gas_executor = ctx.safe_executor(
        &owner,
        ctx.safe_params().with_safe_tx_gas(settings.safe.buy_gas_safe_tx_gas),
    )?;
    let safe = executor.address();
    let bridge = BridgeClient::new(&settings.bridge)?;

    // Pre-checks: nothing is sent unless every step can be funded
    let deposit = bridge.deposit_address(safe).await?;
    let client = ctx.client();
    let (usdc_balance, usdc_e_start) = tokio::try_join!(
        token_balance(client, usdc.address, safe),
        token_balance(client, usdc_e.address, safe),
    )?;
    check_starting_balances(usdc_balance, usdc_e_start, bridge_amount, buy_gas_amount, safe, ctx)?;

    let mut completed = Vec::new();

    // Step 1: bridge
    info!(
        "Step 1: sending {} {} from Safe {:?} to bridge deposit {:?}",
        format_amount(bridge_amount, usdc.decimals),
        usdc.symbol,
        safe,
        deposit
    );
    let batch = SafeBatch::new().push(MetaTransaction::call(usdc.address, transfer_data(deposit, bridge_amount)));
    match executor.execute("bridge transfer", batch).await {
        Ok(result) => completed.push(submitted("bridge transfer", result)),
        Err(e) => return Ok(aborted(completed, "bridge transfer", e)),
    }

    let schedule = PollSchedule::new(
        Duration::from_millis(settings.bridge.credit_poll_interval_ms),
        Duration::from_secs(settings.bridge.credit_timeout_secs),
    );
    let usdc_e_balance = match wait_for_credit(client, usdc_e.address, safe, usdc_e_start, schedule).await {
        Ok(balance) => balance,
        Err(e) => return Ok(aborted(completed, "bridge credit", e)),
    };

    // Step 2: buy gas
    info!(
        "Step 2: buying gas with {} {}",
        format_amount(buy_gas_amount, usdc_e.decimals),
        usdc_e.symbol
    );
    match buy_gas_step(ctx, &buy_gas_executor, buy_gas_amount).await {
        Ok(result) => completed.push(submitted("buy gas", result)),
        Err(e) => return Ok(aborted(completed, "buy gas", e)),
    }

    // Step 3: fee + swap of what is left
    let remaining = usdc_e_balance.saturating_sub(buy_gas_amount);
    let (fee, plan) = match swap_step(ctx, &executor, remaining, fee_bps, fee_recipient, slippage_bps).await {
        Ok((result, fee, plan)) => {
            completed.push(submitted("swap", result));
            (fee, plan)
        }
        Err(e) => return Ok(aborted(completed, "swap", e)),
    };

    info!("Full flow completed for Safe {:?}", safe);

    Ok(OperationReport::from_steps("full-flow", completed)
        .with_explorer(settings)
        .with_details(json!({
            "safe": safe,
            "depositAddress": deposit,
            "bridged": format_amount(bridge_amount, usdc.decimals),
            "buyGas": format_amount(buy_gas_amount, usdc_e.decimals),
            "fee": format_amount(fee, usdc_e.decimals),
            "swap": plan.details(ctx, slippage_bps),
        })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::ops::tests::keyed_settings;
    use std::sync::Arc;

    #[test]
    fn test_split_fee_one_percent() {
        let (fee, swap) = split_fee(U256::from(1_800_000u64), 100).unwrap();
        assert_eq!(fee, U256::from(18_000u64));
        assert_eq!(swap, U256::from(1_782_000u64));
    }

    #[test]
    fn test_split_fee_rounds_down_to_zero_fee() {
        let (fee, swap) = split_fee(U256::from(50u64), 100).unwrap();
        assert!(fee.is_zero());
        assert_eq!(swap, U256::from(50u64));
    }

    #[test]
    fn test_nothing_left_to_swap() {
        assert!(split_fee(U256::zero(), 100).is_err());
    }

    #[test]
    fn test_starting_balance_checks() {
        let ctx = OpsContext::new(keyed_settings(), Arc::new(MockChainClient::new()));
        let safe = Address::repeat_byte(0xaa);
        let two = U256::from(2_000_000u64);
        let point_two = U256::from(200_000u64);

        assert!(check_starting_balances(two, U256::zero(), two, point_two, safe, &ctx).is_ok());

        let err = check_starting_balances(U256::from(1_000_000u64), U256::zero(), two, point_two, safe, &ctx)
            .unwrap_err();
        match err {
            OpsError::InsufficientFunds { asset, need, .. } => {
                assert_eq!(asset, "USDC");
                assert_eq!(need, "2");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = check_starting_balances(two, U256::zero(), two, U256::from(3_000_000u64), safe, &ctx)
            .unwrap_err();
        assert!(matches!(err, OpsError::InsufficientFunds { asset, .. } if asset == "USDC.e"));
    }

    #[tokio::test]
    async fn test_below_bridge_minimum_rejected_before_network() {
        let ctx = OpsContext::new(keyed_settings(), Arc::new(MockChainClient::new()));
        let request = FullFlowRequest {
            bridge_amount: Some("1.5".to_string()),
            ..Default::default()
        };
        let err = full_flow(&ctx, &request).await.unwrap_err();
        assert!(matches!(err, OpsError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_fee_recipient_required_when_charging() {
        let mut settings = keyed_settings();
        settings.accounts.fee_recipient = String::new();
        let ctx = OpsContext::new(settings, Arc::new(MockChainClient::new()));

        let err = full_flow(&ctx, &FullFlowRequest::default()).await.unwrap_err();
        assert!(matches!(err, OpsError::Config { field, .. } if field == "accounts.fee_recipient"));
    }
}
