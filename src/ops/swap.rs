//! USDC.e -> USDC through Permit2 and the Universal Router

use super::reads::usdc_e_to_usdc_pool;
use super::{unix_now, OperationReport, OpsContext};
use crate::contracts::router::{
    default_hook_data, execute_swap_data, min_amount_out, quote_exact_input_single, ExactInputSingle,
};
use crate::contracts::{approve_data, max_uint160, permit2_allowance, permit2_approve_data, token_allowance};
use crate::error::{OpsError, OpsResult};
use crate::safe::{MetaTransaction, SafeBatch};
use crate::tx::{run_sequence, ConditionalStep, Precondition, Step, TxCall};
use crate::units::{format_amount, parse_amount};

use ethers::types::{Address, U256};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub amount: String,
    /// Overrides `policy.slippage_bps`
    pub slippage_bps: Option<u32>,
    pub via_safe: bool,
    pub bump_percent: Option<u64>,
}

/// Quoted swap with its approvals, ready to run as steps or as a batch
#[derive(Debug, Clone)]
pub(crate) struct SwapPlan {
    pub amount_in: U256,
    pub quoted_out: U256,
    pub min_out: U256,
    pub deadline: u64,
    token: Address,
    permit2: Address,
    router: Address,
    execute_data: Vec<u8>,
}

impl SwapPlan {
    pub async fn quote(ctx: &OpsContext, amount_in: U256, slippage_bps: u32) -> OpsResult<Self> {
        if slippage_bps >= 10_000 {
            return Err(OpsError::InvalidAmount {
                input: slippage_bps.to_string(),
                message: "slippage must be below 10000 bps".to_string(),
            });
        }
        let contracts = &ctx.settings.contracts;
        let quoter = ctx.settings.require_contract("v4_quoter", contracts.v4_quoter)?;
        let router = ctx
            .settings
            .require_contract("universal_router", contracts.universal_router)?;
        let permit2 = ctx.settings.require_contract("permit2", contracts.permit2)?;

        let (pool_key, zero_for_one) = usdc_e_to_usdc_pool(ctx);
        let quoted_out =
            quote_exact_input_single(ctx.client(), quoter, pool_key, zero_for_one, amount_in).await?;
        if quoted_out.is_zero() {
            return Err(OpsError::Contract("quoter returned zero output".to_string()));
        }
        let min_out = min_amount_out(quoted_out, slippage_bps);
        let deadline = ctx.deadline();

        let swap = ExactInputSingle {
            pool_key,
            zero_for_one,
            amount_in,
            amount_out_minimum: min_out,
            hook_data: default_hook_data(),
        };

        info!(
            "Swap quote: {} in -> {} out, minimum {} ({} bps slippage)",
            amount_in, quoted_out, min_out, slippage_bps
        );

        Ok(Self {
            amount_in,
            quoted_out,
            min_out,
            deadline,
            token: ctx.usdc_e().address,
            permit2,
            router,
            execute_data: execute_swap_data(&swap, deadline)?,
        })
    }

    fn erc20_approve_data(&self) -> Vec<u8> {
        approve_data(self.permit2, U256::MAX)
    }

    fn permit2_approve_data(&self) -> Vec<u8> {
        permit2_approve_data(self.token, self.router, max_uint160(), self.deadline)
    }

    /// ERC-20 approve, Permit2 approve and execute from an EOA; the two
    /// approvals are skipped when current allowances already cover the swap
    pub fn steps(&self, owner: Address, ctx: &OpsContext) -> Vec<Box<dyn Step>> {
        let limits = &ctx.settings.gas.limits;
        vec![
            Box::new(ConditionalStep::new(
                "approve USDC.e for Permit2",
                Precondition::AllowanceBelow {
                    token: self.token,
                    owner,
                    spender: self.permit2,
                    amount: self.amount_in,
                },
                TxCall::new(self.token, self.erc20_approve_data(), limits.approve),
            )),
            Box::new(ConditionalStep::new(
                "Permit2 approve router",
                Precondition::Permit2AllowanceBelow {
                    permit2: self.permit2,
                    token: self.token,
                    owner,
                    spender: self.router,
                    amount: self.amount_in,
                    now: unix_now(),
                },
                TxCall::new(self.permit2, self.permit2_approve_data(), limits.approve),
            )),
            Box::new(ConditionalStep::always(
                "router execute",
                TxCall::new(self.router, self.execute_data.clone(), limits.swap),
            )),
        ]
    }

    /// Append the approvals the Safe still needs, then the swap
    pub async fn append_to_batch(
        &self,
        ctx: &OpsContext,
        safe: Address,
        batch: SafeBatch,
    ) -> OpsResult<SafeBatch> {
        let client = ctx.client();
        let (erc20_allowance, permit) = tokio::try_join!(
            token_allowance(client, self.token, safe, self.permit2),
            permit2_allowance(client, self.permit2, safe, self.token, self.router),
        )?;
        let needs_erc20 = erc20_allowance < self.amount_in;
        let needs_permit2 = permit.amount < self.amount_in || permit.expiration <= unix_now();

        info!(
            "Safe {:?} approvals: ERC-20 {}, Permit2 {}",
            safe,
            if needs_erc20 { "needed" } else { "sufficient" },
            if needs_permit2 { "needed" } else { "sufficient" }
        );

        Ok(batch
            .push_if(needs_erc20, MetaTransaction::call(self.token, self.erc20_approve_data()))
            .push_if(
                needs_permit2,
                MetaTransaction::call(self.permit2, self.permit2_approve_data()),
            )
            .push(MetaTransaction::call(self.router, self.execute_data.clone())))
    }

    pub fn details(&self, ctx: &OpsContext, slippage_bps: u32) -> serde_json::Value {
        let (usdc, usdc_e) = (ctx.usdc(), ctx.usdc_e());
        json!({
            "amountIn": format_amount(self.amount_in, usdc_e.decimals),
            "quotedOut": format_amount(self.quoted_out, usdc.decimals),
            "minimumOut": format_amount(self.min_out, usdc.decimals),
            "slippageBps": slippage_bps,
            "deadline": self.deadline,
        })
    }
}

pub async fn swap(ctx: &OpsContext, request: &SwapRequest) -> OpsResult<OperationReport> {
    let token = ctx.usdc_e().clone();
    let amount_in = parse_amount(&request.amount, token.decimals)?;
    let slippage_bps = request.slippage_bps.unwrap_or(ctx.settings.policy.slippage_bps);
    let sender = ctx.eoa_sender(request.bump_percent)?;

    if request.via_safe {
        let executor = ctx.safe_executor(&sender, ctx.safe_params())?;
        let safe = executor.address();
        ctx.require_token_balance(&token, safe, amount_in).await?;

        let plan = SwapPlan::quote(ctx, amount_in, slippage_bps).await?;
        let batch = plan.append_to_batch(ctx, safe, SafeBatch::new()).await?;
        let result = executor.execute("swap batch", batch).await?;

        return Ok(OperationReport::submitted("swap", [&result])
            .with_explorer(&ctx.settings)
            .with_details(plan.details(ctx, slippage_bps)));
    }

    let owner = sender.address();
    ctx.require_token_balance(&token, owner, amount_in).await?;

    let plan = SwapPlan::quote(ctx, amount_in, slippage_bps).await?;
    let steps = plan.steps(owner, ctx);

    let report = match run_sequence(&sender, &steps).await {
        Ok(outcomes) => OperationReport::from_steps("swap", outcomes),
        Err(e) => OperationReport::from_sequence_error("swap", e),
    };
    Ok(report
        .with_explorer(&ctx.settings)
        .with_details(plan.details(ctx, slippage_bps)))
}
