//! ERC-20 transfer from the owner EOA or the Safe

use super::{OperationReport, OpsContext, TokenChoice};
use crate::contracts::transfer_data;
use crate::error::OpsResult;
use crate::safe::{MetaTransaction, SafeBatch};
use crate::tx::TxCall;
use crate::units::{format_amount, parse_amount};

use ethers::types::Address;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub amount: String,
    /// Defaults to the relayer account
    pub to: Option<Address>,
    pub token: TokenChoice,
    pub via_safe: bool,
    pub bump_percent: Option<u64>,
}

pub async fn send(ctx: &OpsContext, request: &TransferRequest) -> OpsResult<OperationReport> {
    let token = ctx.token(request.token).clone();
    let amount = parse_amount(&request.amount, token.decimals)?;
    let to = match request.to {
        Some(to) => to,
        None => ctx.settings.require_relayer_address()?,
    };
    let sender = ctx.eoa_sender(request.bump_percent)?;

    let result = if request.via_safe {
        let executor = ctx.safe_executor(&sender, ctx.safe_params())?;
        ctx.require_token_balance(&token, executor.address(), amount).await?;

        info!(
            "Transferring {} {} from Safe {:?} to {:?}",
            request.amount, token.symbol, executor.address(), to
        );
        let batch = SafeBatch::new().push(MetaTransaction::call(token.address, transfer_data(to, amount)));
        executor.execute("transfer", batch).await?
    } else {
        ctx.require_token_balance(&token, sender.address(), amount).await?;

        info!(
            "Transferring {} {} from {:?} to {:?}",
            request.amount, token.symbol, sender.address(), to
        );
        let call = TxCall::new(
            token.address,
            transfer_data(to, amount),
            ctx.settings.gas.limits.transfer,
        );
        sender.submit_and_wait("transfer", &call).await?
    };

    Ok(OperationReport::submitted("send", [&result])
        .with_explorer(&ctx.settings)
        .with_details(json!({
            "token": token.symbol,
            "amount": format_amount(amount, token.decimals),
            "to": to,
            "viaSafe": request.via_safe,
        })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::config::tests::sample_settings;
    use crate::error::OpsError;
    use std::sync::Arc;

    fn request(amount: &str) -> TransferRequest {
        TransferRequest {
            amount: amount.to_string(),
            to: Some(Address::repeat_byte(0x11)),
            token: TokenChoice::Usdc,
            via_safe: false,
            bump_percent: None,
        }
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_network() {
        // No expectations: any RPC call would panic the mock
        let ctx = OpsContext::new(sample_settings(), Arc::new(MockChainClient::new()));
        let err = send(&ctx, &request("1")).await.unwrap_err();
        assert!(matches!(err, OpsError::Config { .. }));
    }

    #[tokio::test]
    async fn test_bad_amount_fails_before_network() {
        let ctx = OpsContext::new(sample_settings(), Arc::new(MockChainClient::new()));
        let err = send(&ctx, &request("1.1234567")).await.unwrap_err();
        assert!(matches!(err, OpsError::InvalidAmount { .. }));
    }
}
