//! Flash-loan composition and provider authorization.
//!
//! A flash-funded execution is one atomic bundle: leg 0 borrows, legs 1..n
//! run the route swaps, leg n+1 repays `loan + fee` with safe-transfer
//! semantics. Callbacks are only honored from registered providers, and the
//! borrow never happens unless expected profit clears `fee + gas`.

use crate::ExecutionError;
use config::FlashLoanProviderConfig;
use rust_decimal::Decimal;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use tracing::debug;
use types::{ChainId, EvmAddress, TxDraft};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLoanProvider {
    pub name: String,
    pub address: EvmAddress,
    pub fee_bps: u32,
}

#[derive(Default)]
pub struct FlashLoanRegistry {
    providers: HashMap<EvmAddress, FlashLoanProvider>,
}

impl FlashLoanRegistry {
    pub fn from_config(configs: &[FlashLoanProviderConfig]) -> Result<Self, ExecutionError> {
        let mut providers = HashMap::new();
        for config in configs {
            let address = parse_address(&config.address)?;
            providers.insert(
                address,
                FlashLoanProvider {
                    name: config.name.clone(),
                    address,
                    fee_bps: config.fee_bps,
                },
            );
        }
        Ok(Self { providers })
    }

    pub fn get(&self, address: &EvmAddress) -> Result<&FlashLoanProvider, ExecutionError> {
        self.providers
            .get(address)
            .ok_or(ExecutionError::UnknownFlashLoanProvider { provider: *address })
    }

    /// Callback authorization: only registered providers may re-enter.
    pub fn is_authorized_callback(&self, caller: &EvmAddress) -> bool {
        self.providers.contains_key(caller)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Loan fee rounded up so repayment never undershoots.
pub fn loan_fee(amount: u128, fee_bps: u32) -> u128 {
    let numerator = amount.saturating_mul(fee_bps as u128);
    numerator / 10_000 + u128::from(numerator % 10_000 != 0)
}

/// Precondition gate: the borrow is refused outright when the route cannot
/// cover its own repayment.
pub fn check_loan_viability(
    expected_profit_usd: Decimal,
    loan_fee_usd: Decimal,
    gas_cost_usd: Decimal,
) -> Result<(), ExecutionError> {
    if expected_profit_usd <= loan_fee_usd + gas_cost_usd {
        return Err(ExecutionError::UnprofitableLoan {
            profit_usd: expected_profit_usd,
            fee_usd: loan_fee_usd,
            gas_usd: gas_cost_usd,
        });
    }
    Ok(())
}

/// Calldata for the borrow entry: `flashLoanSimple(receiver, asset, amount,
/// params, referral)`.
pub fn borrow_calldata(
    receiver: &EvmAddress,
    asset: &EvmAddress,
    amount: u128,
    params: &[u8],
) -> Vec<u8> {
    use ethers::abi::{encode, Token};
    let mut calldata =
        selector("flashLoanSimple(address,address,uint256,bytes,uint16)").to_vec();
    calldata.extend(encode(&[
        Token::Address(ethers::types::H160::from(*receiver)),
        Token::Address(ethers::types::H160::from(*asset)),
        Token::Uint(ethers::types::U256::from(amount)),
        Token::Bytes(params.to_vec()),
        Token::Uint(ethers::types::U256::zero()),
    ]));
    calldata
}

/// Repayment transfer with safe-transfer semantics: the ERC-20 `transfer`
/// return value is checked by the executing contract.
pub fn repay_draft(
    chain: ChainId,
    asset: EvmAddress,
    provider: &FlashLoanProvider,
    loan_amount: u128,
) -> TxDraft {
    use ethers::abi::{encode, Token};
    let repayment = loan_amount.saturating_add(loan_fee(loan_amount, provider.fee_bps));
    let mut calldata = selector("transfer(address,uint256)").to_vec();
    calldata.extend(encode(&[
        Token::Address(ethers::types::H160::from(provider.address)),
        Token::Uint(ethers::types::U256::from(repayment)),
    ]));
    debug!(
        provider = %provider.name,
        repayment,
        "composed flash loan repayment"
    );
    TxDraft {
        chain,
        to: asset,
        data: calldata,
        value: 0,
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

fn parse_address(hex_address: &str) -> Result<EvmAddress, ExecutionError> {
    let stripped = hex_address.trim_start_matches("0x");
    let bytes = hex::decode(stripped).map_err(|_| ExecutionError::InvalidProviderAddress {
        address: hex_address.to_string(),
    })?;
    bytes
        .try_into()
        .map_err(|_| ExecutionError::InvalidProviderAddress {
            address: hex_address.to_string(),
        })
}
