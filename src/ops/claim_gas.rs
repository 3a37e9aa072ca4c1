//! Relayed gas claim through the SendGas contract
//!
//! The recipient EOA signs an EIP-712 `ClaimGasFor(recipient, deadline)`
//! message; the relayer account submits it and pays for the transaction.

use super::{OperationReport, OpsContext};
use crate::contracts::{read, send_gas};
use crate::error::{OpsError, OpsResult};
use crate::tx::TxCall;

use ethers::abi::AbiEncode;
use ethers::signers::Signer;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, U256};
use serde_json::json;
use tracing::{debug, info};

const DOMAIN_NAME: &str = "SendGas";
const DOMAIN_VERSION: &str = "1";

#[derive(Debug, Clone, Default)]
pub struct ClaimGasRequest {
    pub bump_percent: Option<u64>,
}

/// EIP-712 payload the recipient signs
pub fn claim_typed_data(
    chain_id: u64,
    send_gas: Address,
    recipient: Address,
    deadline: u64,
) -> OpsResult<TypedData> {
    let value = json!({
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" }
            ],
            "ClaimGasFor": [
                { "name": "recipient", "type": "address" },
                { "name": "deadline", "type": "uint256" }
            ]
        },
        "primaryType": "ClaimGasFor",
        "domain": {
            "name": DOMAIN_NAME,
            "version": DOMAIN_VERSION,
            "chainId": chain_id,
            "verifyingContract": send_gas
        },
        "message": {
            "recipient": recipient,
            "deadline": deadline.to_string()
        }
    });
    serde_json::from_value(value).map_err(|e| OpsError::Internal(format!("typed data: {}", e)))
}

pub async fn claim_gas(ctx: &OpsContext, request: &ClaimGasRequest) -> OpsResult<OperationReport> {
    let settings = &ctx.settings;
    let signer = settings.require_eoa_wallet()?;
    let recipient = settings.require_eoa_address()?;
    let send_gas_address = settings.require_contract("send_gas", settings.contracts.send_gas)?;
    if signer.address() != recipient {
        return Err(OpsError::config(
            "accounts.eoa_address",
            format!("{:?} is not the address of PRIVATE_KEY_EOA", recipient),
        ));
    }
    let relayer = ctx.relayer_sender(request.bump_percent)?;

    let client = ctx.client();
    let (claimed, remaining): (send_gas::HasClaimedGasReturn, send_gas::RemainingClaimsReturn) = tokio::try_join!(
        read(client, send_gas_address, send_gas::HasClaimedGasCall { addr: recipient }),
        read(client, send_gas_address, send_gas::RemainingClaimsCall),
    )?;
    let (already_claimed, remaining) = (claimed.0, remaining.0);

    if already_claimed {
        return Err(OpsError::Contract(format!("AlreadyClaimed: {:?}", recipient)));
    }
    if remaining.is_zero() {
        return Err(OpsError::Contract(
            "InsufficientBalance: SendGas has no claims remaining".to_string(),
        ));
    }
    debug!("SendGas has {} claim(s) remaining", remaining);

    let deadline = ctx.deadline();
    let typed_data = claim_typed_data(settings.chain.chain_id, send_gas_address, recipient, deadline)?;
    let signature = signer.sign_typed_data(&typed_data).await?;
    debug!("ClaimGasFor signature 0x{}", hex::encode(signature.to_vec()));

    info!(
        "Relaying gas claim for {:?} from {:?} (deadline {})",
        recipient,
        relayer.address(),
        deadline
    );

    let data = send_gas::ClaimGasForCall {
        recipient,
        deadline: U256::from(deadline),
        signature: Bytes::from(signature.to_vec()),
    }
    .encode();
    let call = TxCall::new(send_gas_address, data, settings.gas.limits.claim_gas);
    let result = relayer.submit_and_wait("claimGasFor", &call).await?;

    Ok(OperationReport::submitted("claim-gas", [&result])
        .with_explorer(settings)
        .with_details(json!({
            "recipient": recipient,
            "relayer": relayer.address(),
            "deadline": deadline,
            "remainingClaims": remaining.to_string(),
        })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::contracts::tests::uint_word;
    use crate::ops::tests::keyed_settings;
    use crate::tx::sender::tests::test_wallet;
    use ethers::types::transaction::eip712::Eip712;
    use ethers::types::H256;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signature_recovers_recipient() {
        let wallet = test_wallet();
        let typed = claim_typed_data(137, Address::repeat_byte(0x24), wallet.address(), 1_700_003_600).unwrap();

        let digest = typed.encode_eip712().unwrap();
        let signature = wallet.sign_typed_data(&typed).await.unwrap();

        assert_eq!(signature.to_vec().len(), 65);
        assert_eq!(signature.recover(H256::from(digest)).unwrap(), wallet.address());
    }

    #[test]
    fn test_digest_depends_on_deadline() {
        let recipient = Address::repeat_byte(0x11);
        let a = claim_typed_data(137, Address::repeat_byte(0x24), recipient, 1).unwrap();
        let b = claim_typed_data(137, Address::repeat_byte(0x24), recipient, 2).unwrap();
        assert_ne!(a.encode_eip712().unwrap(), b.encode_eip712().unwrap());
    }

    #[tokio::test]
    async fn test_already_claimed_stops_before_submit() {
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client.expect_call().returning(|_, data| {
            // hasClaimedGas -> true, remainingClaims -> 5
            if data.len() > 4 {
                Ok(uint_word(U256::one()))
            } else {
                Ok(uint_word(U256::from(5u64)))
            }
        });

        let ctx = OpsContext::new(keyed_settings(), Arc::new(client));
        let err = claim_gas(&ctx, &ClaimGasRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("AlreadyClaimed"));
    }

    #[tokio::test]
    async fn test_no_remaining_claims() {
        let mut client = MockChainClient::new();
        client.expect_chain_id().return_const(137u64);
        client.expect_call().returning(|_, _| Ok(uint_word(U256::zero())));

        let ctx = OpsContext::new(keyed_settings(), Arc::new(client));
        let err = claim_gas(&ctx, &ClaimGasRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("InsufficientBalance"));
    }
}
