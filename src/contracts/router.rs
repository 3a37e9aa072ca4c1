//! Uniswap v4 single-hop exact-input swaps through the Universal Router

use super::read;
use crate::chain::ChainClient;
use crate::config::PoolConfig;
use crate::error::{OpsError, OpsResult};

use ethers::abi::{encode, AbiEncode, Token};
use ethers::types::{Address, Bytes, I256, U256};
use tracing::debug;

ethers::contract::abigen!(
    UniversalRouter,
    r#"[
        function execute(bytes commands, bytes[] inputs, uint256 deadline) external payable
    ]"#
);

ethers::contract::abigen!(
    V4Quoter,
    r#"[{
        "type": "function",
        "name": "quoteExactInputSingle",
        "stateMutability": "nonpayable",
        "inputs": [{
            "name": "params",
            "type": "tuple",
            "components": [
                {
                    "name": "poolKey",
                    "type": "tuple",
                    "components": [
                        { "name": "currency0", "type": "address" },
                        { "name": "currency1", "type": "address" },
                        { "name": "fee", "type": "uint24" },
                        { "name": "tickSpacing", "type": "int24" },
                        { "name": "hooks", "type": "address" }
                    ]
                },
                { "name": "zeroForOne", "type": "bool" },
                { "name": "exactAmount", "type": "uint128" },
                { "name": "hookData", "type": "bytes" }
            ]
        }],
        "outputs": [
            { "name": "amountOut", "type": "uint256" },
            { "name": "gasEstimate", "type": "uint256" }
        ]
    }]"#
);

/// Universal Router command
pub const V4_SWAP: u8 = 0x10;

/// v4 router actions
pub const SWAP_EXACT_IN_SINGLE: u8 = 0x06;
pub const SETTLE_ALL: u8 = 0x0c;
pub const TAKE_ALL: u8 = 0x0f;

const BPS_DENOMINATOR: u64 = 10_000;

/// v4 pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolKey {
    pub currency0: Address,
    pub currency1: Address,
    pub fee: u32,
    pub tick_spacing: i32,
    pub hooks: Address,
}

impl PoolKey {
    pub fn new(currency0: Address, currency1: Address, pool: &PoolConfig) -> Self {
        Self {
            currency0,
            currency1,
            fee: pool.fee,
            tick_spacing: pool.tick_spacing,
            hooks: pool.hooks,
        }
    }

    fn into_token(self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.currency0),
            Token::Address(self.currency1),
            Token::Uint(U256::from(self.fee)),
            Token::Int(I256::from(self.tick_spacing).into_raw()),
            Token::Address(self.hooks),
        ])
    }
}

/// Parameters of `SWAP_EXACT_IN_SINGLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactInputSingle {
    pub pool_key: PoolKey,
    pub zero_for_one: bool,
    pub amount_in: U256,
    pub amount_out_minimum: U256,
    pub hook_data: Bytes,
}

impl ExactInputSingle {
    fn input_currency(&self) -> Address {
        if self.zero_for_one {
            self.pool_key.currency0
        } else {
            self.pool_key.currency1
        }
    }

    fn output_currency(&self) -> Address {
        if self.zero_for_one {
            self.pool_key.currency1
        } else {
            self.pool_key.currency0
        }
    }
}

/// Hook data the pools are quoted and swapped with
pub fn default_hook_data() -> Bytes {
    Bytes::from(vec![0u8])
}

fn as_u128(field: &str, amount: U256) -> OpsResult<u128> {
    if amount > U256::from(u128::MAX) {
        return Err(OpsError::InvalidAmount {
            input: amount.to_string(),
            message: format!("{} exceeds uint128", field),
        });
    }
    Ok(amount.as_u128())
}

/// `quoted` reduced by `slippage_bps`, truncating
pub fn min_amount_out(quoted: U256, slippage_bps: u32) -> U256 {
    let keep = BPS_DENOMINATOR.saturating_sub(u64::from(slippage_bps));
    quoted * U256::from(keep) / U256::from(BPS_DENOMINATOR)
}

/// Quote an exact-input single-pool swap with the v4 quoter (read-only)
pub async fn quote_exact_input_single(
    client: &dyn ChainClient,
    quoter: Address,
    pool_key: PoolKey,
    zero_for_one: bool,
    amount_in: U256,
) -> OpsResult<U256> {
    let params = (
        (
            pool_key.currency0,
            pool_key.currency1,
            pool_key.fee,
            pool_key.tick_spacing,
            pool_key.hooks,
        ),
        zero_for_one,
        as_u128("amount_in", amount_in)?,
        default_hook_data(),
    );

    let quoted: QuoteExactInputSingleReturn =
        read(client, quoter, QuoteExactInputSingleCall { params }).await?;

    debug!("Quoted {} in -> {} out", amount_in, quoted.amount_out);
    Ok(quoted.amount_out)
}

/// `abi.encode(bytes actions, bytes[] params)` for one exact-in swap that
/// settles the input and takes the output
pub fn encode_v4_swap(swap: &ExactInputSingle) -> OpsResult<Bytes> {
    let amount_in = as_u128("amount_in", swap.amount_in)?;
    let amount_out_minimum = as_u128("amount_out_minimum", swap.amount_out_minimum)?;

    let swap_params = encode(&[Token::Tuple(vec![
        swap.pool_key.into_token(),
        Token::Bool(swap.zero_for_one),
        Token::Uint(U256::from(amount_in)),
        Token::Uint(U256::from(amount_out_minimum)),
        Token::Bytes(swap.hook_data.to_vec()),
    ])]);
    let settle_params = encode(&[
        Token::Address(swap.input_currency()),
        Token::Uint(swap.amount_in),
    ]);
    let take_params = encode(&[
        Token::Address(swap.output_currency()),
        Token::Uint(swap.amount_out_minimum),
    ]);

    let actions = vec![SWAP_EXACT_IN_SINGLE, SETTLE_ALL, TAKE_ALL];
    let params = vec![
        Token::Bytes(swap_params),
        Token::Bytes(settle_params),
        Token::Bytes(take_params),
    ];

    Ok(encode(&[Token::Bytes(actions), Token::Array(params)]).into())
}

/// Universal Router `execute` call data for a single v4 swap
pub fn execute_swap_data(swap: &ExactInputSingle, deadline: u64) -> OpsResult<Vec<u8>> {
    let input = encode_v4_swap(swap)?;
    Ok(ExecuteCall {
        commands: Bytes::from(vec![V4_SWAP]),
        inputs: vec![input],
        deadline: U256::from(deadline),
    }
    .encode())
}
