//! Human decimal amounts to base units and back

use crate::error::{OpsError, OpsResult};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};

/// Parse a positive decimal string such as `"2"` or `"0.2"` into base units
pub fn parse_amount(input: &str, decimals: u8) -> OpsResult<U256> {
    let trimmed = input.trim();
    let invalid = |message: &str| OpsError::InvalidAmount {
        input: input.to_string(),
        message: message.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("amount is empty"));
    }
    if trimmed.starts_with('-') || trimmed.starts_with('+') {
        return Err(invalid("amount must be an unsigned decimal"));
    }
    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.len() > decimals as usize {
            return Err(invalid(&format!("more than {} decimal places", decimals)));
        }
    }

    let amount = match parse_units(trimmed, u32::from(decimals)) {
        Ok(ParseUnits::U256(amount)) => amount,
        Ok(ParseUnits::I256(_)) => return Err(invalid("amount must be an unsigned decimal")),
        Err(e) => return Err(invalid(&e.to_string())),
    };

    if amount.is_zero() {
        return Err(invalid("amount must be greater than zero"));
    }
    Ok(amount)
}

/// Render base units as a decimal string with trailing zeros removed
pub fn format_amount(amount: U256, decimals: u8) -> String {
    let formatted = format_units(amount, u32::from(decimals)).unwrap_or_else(|_| amount.to_string());
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_string()
            } else {
                format!("{}.{}", whole, fraction)
            }
        }
        None => formatted,
    }
}

/// `amount * bps / 10000`, truncating
pub fn bps_of(amount: U256, bps: u32) -> U256 {
    amount * U256::from(bps) / U256::from(10_000u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usdc_amounts() {
        assert_eq!(parse_amount("2", 6).unwrap(), U256::from(2_000_000u64));
        assert_eq!(parse_amount("0.2", 6).unwrap(), U256::from(200_000u64));
        assert_eq!(parse_amount(" 1.5 ", 6).unwrap(), U256::from(1_500_000u64));
        assert_eq!(parse_amount("0.000001", 6).unwrap(), U256::one());
    }

    #[test]
    fn test_parse_native_amount() {
        assert_eq!(parse_amount("0.01", 18).unwrap(), U256::exp10(16));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in ["", "0", "0.0", "-1", "abc", "1.0000001"] {
            let err = parse_amount(bad, 6).unwrap_err();
            assert!(
                matches!(err, OpsError::InvalidAmount { .. }),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(U256::from(2_000_000u64), 6), "2");
        assert_eq!(format_amount(U256::from(1_234_500u64), 6), "1.2345");
        assert_eq!(format_amount(U256::zero(), 6), "0");
    }

    #[test]
    fn test_bps_of() {
        assert_eq!(bps_of(U256::from(1_800_000u64), 100), U256::from(18_000u64));
        assert_eq!(bps_of(U256::from(99u64), 100), U256::zero());
    }
}
