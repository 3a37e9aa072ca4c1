//! Contract bindings
//!
//! Generated call/return types are encoded against a [`ChainClient`] rather
//! than a middleware, so every read goes through the same mockable seam as
//! the submission controller.

pub mod router;

use crate::chain::ChainClient;
use crate::error::{OpsError, OpsResult};

use ethers::abi::{AbiDecode, AbiEncode};
use ethers::types::{Address, U256};

pub mod erc20 {
    ethers::contract::abigen!(
        Erc20,
        r#"[
            function balanceOf(address account) external view returns (uint256)
            function allowance(address owner, address spender) external view returns (uint256)
            function approve(address spender, uint256 amount) external returns (bool)
            function transfer(address to, uint256 amount) external returns (bool)
        ]"#
    );
}

pub mod permit2 {
    ethers::contract::abigen!(
        Permit2,
        r#"[
            function allowance(address user, address token, address spender) external view returns (uint160 amount, uint48 expiration, uint48 nonce)
            function approve(address token, address spender, uint160 amount, uint48 expiration) external
        ]"#
    );
}

pub mod buy_gas {
    ethers::contract::abigen!(
        BuyGas,
        r#"[
            function buyGas(uint256 usdcAmount) external
        ]"#
    );
}

pub mod buy_usdce {
    ethers::contract::abigen!(
        BuyUsdcE,
        r#"[
            function swapUsdcForUsdCe(uint256 usdcAmount) external
        ]"#
    );
}

pub mod send_gas {
    ethers::contract::abigen!(
        SendGas,
        r#"[
            function claimGasFor(address recipient, uint256 deadline, bytes signature) external
            function hasClaimedGas(address addr) external view returns (bool)
            function getBalance() external view returns (uint256)
            function remainingClaims() external view returns (uint256)
        ]"#
    );
}

pub mod safe {
    ethers::contract::abigen!(
        GnosisSafe,
        r#"[
            function nonce() external view returns (uint256)
            function getThreshold() external view returns (uint256)
            function getTransactionHash(address to, uint256 value, bytes data, uint8 operation, uint256 safeTxGas, uint256 baseGas, uint256 gasPrice, address gasToken, address refundReceiver, uint256 txNonce) external view returns (bytes32)
            function execTransaction(address to, uint256 value, bytes data, uint8 operation, uint256 safeTxGas, uint256 baseGas, uint256 gasPrice, address gasToken, address refundReceiver, bytes signatures) external payable returns (bool)
        ]"#
    );
}

pub mod multisend {
    ethers::contract::abigen!(
        MultiSendCallOnly,
        r#"[
            function multiSend(bytes transactions) external payable
        ]"#
    );
}

/// `type(uint160).max`, the unlimited Permit2 allowance
pub fn max_uint160() -> U256 {
    (U256::one() << 160) - 1
}

/// Typed `eth_call`: encode `call`, decode the return data as `R`
pub async fn read<C, R>(client: &dyn ChainClient, to: Address, call: C) -> OpsResult<R>
where
    C: AbiEncode + Send,
    R: AbiDecode,
{
    let output = client.call(to, call.encode().into()).await?;
    R::decode(output.as_ref()).map_err(|e| OpsError::Contract(format!("decode from {:?}: {}", to, e)))
}

pub async fn token_balance(client: &dyn ChainClient, token: Address, account: Address) -> OpsResult<U256> {
    let erc20::BalanceOfReturn(balance) =
        read(client, token, erc20::BalanceOfCall { account }).await?;
    Ok(balance)
}

pub async fn token_allowance(
    client: &dyn ChainClient,
    token: Address,
    owner: Address,
    spender: Address,
) -> OpsResult<U256> {
    let erc20::AllowanceReturn(allowance) =
        read(client, token, erc20::AllowanceCall { owner, spender }).await?;
    Ok(allowance)
}

/// Permit2 allowance of `spender` over `owner`'s `token`
pub async fn permit2_allowance(
    client: &dyn ChainClient,
    permit2: Address,
    owner: Address,
    token: Address,
    spender: Address,
) -> OpsResult<permit2::AllowanceReturn> {
    read(
        client,
        permit2,
        permit2::AllowanceCall {
            user: owner,
            token,
            spender,
        },
    )
    .await
}

pub fn transfer_data(to: Address, amount: U256) -> Vec<u8> {
    erc20::TransferCall { to, amount }.encode()
}

pub fn approve_data(spender: Address, amount: U256) -> Vec<u8> {
    erc20::ApproveCall { spender, amount }.encode()
}

/// Permit2 approval of `spender` for `token`, valid until `expiration`
pub fn permit2_approve_data(token: Address, spender: Address, amount: U256, expiration: u64) -> Vec<u8> {
    permit2::ApproveCall {
        token,
        spender,
        amount,
        expiration,
    }
    .encode()
}

pub fn buy_gas_data(usdc_amount: U256) -> Vec<u8> {
    buy_gas::BuyGasCall { usdc_amount }.encode()
}

pub fn swap_usdc_for_usdce_data(usdc_amount: U256) -> Vec<u8> {
    buy_usdce::SwapUsdcForUsdCeCall { usdc_amount }.encode()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use ethers::abi::{encode, Token};
    use ethers::types::Bytes;

    pub(crate) fn uint_word(value: U256) -> Bytes {
        encode(&[Token::Uint(value)]).into()
    }

    #[test]
    fn test_selectors() {
        assert_eq!(&transfer_data(Address::zero(), U256::one())[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(&approve_data(Address::zero(), U256::one())[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(transfer_data(Address::zero(), U256::one()).len(), 4 + 64);
    }

    #[test]
    fn test_max_uint160() {
        assert_eq!(format!("{:#x}", max_uint160()), format!("0x{}", "f".repeat(40)));
    }

    #[tokio::test]
    async fn test_token_balance_decodes_word() {
        let token = Address::repeat_byte(0x2c);
        let mut client = MockChainClient::new();
        client
            .expect_call()
            .withf(move |to, data| *to == token && data[..4] == [0x70, 0xa0, 0x82, 0x31])
            .returning(|_, _| Ok(uint_word(U256::from(2_500_000u64))));

        let balance = token_balance(&client, token, Address::repeat_byte(1)).await.unwrap();
        assert_eq!(balance, U256::from(2_500_000u64));
    }

    #[tokio::test]
    async fn test_permit2_allowance_tuple() {
        let mut client = MockChainClient::new();
        client.expect_call().returning(|_, _| {
            Ok(encode(&[
                Token::Uint(U256::from(1_000u64)),
                Token::Uint(U256::from(1_700_000_000u64)),
                Token::Uint(U256::zero()),
            ])
            .into())
        });

        let allowance = permit2_allowance(
            &client,
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            Address::repeat_byte(4),
            Address::repeat_byte(5),
        )
        .await
        .unwrap();
        assert_eq!(allowance.amount, U256::from(1_000u64));
        assert_eq!(allowance.expiration, 1_700_000_000u64);
    }

    #[tokio::test]
    async fn test_short_return_is_contract_error() {
        let mut client = MockChainClient::new();
        client.expect_call().returning(|_, _| Ok(Bytes::new()));

        let err = token_balance(&client, Address::zero(), Address::zero()).await.unwrap_err();
        assert!(matches!(err, OpsError::Contract(_)));
    }
}
