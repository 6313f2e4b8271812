//! Money Conversion Module
//!
//! Unified conversion between the internal u64 minor-unit representation
//! and the client-facing string/Decimal representation. All conversions
//! MUST go through this module.
//!
//! ## Internal Representation
//! - All amounts are stored as `u64` (or `i64` for signed deltas)
//! - The scale factor is `10^decimals` (e.g. 10^2 for USD = cents)
//! - Balances are integers end to end: no floating point anywhere in the
//!   ledger, projection, distributor or settlement paths

use rust_decimal::prelude::*;
use thiserror::Error;

/// Money conversion errors
#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Convert a client string amount to internal u64 minor units
///
/// # Errors
/// * `PrecisionOverflow` - input has more decimal places than the asset allows
/// * `InvalidAmount` - amount is zero or negative
/// * `Overflow` - result would overflow u64
/// * `InvalidFormat` - string format is invalid
pub fn parse_amount(amount_str: &str, decimals: u32) -> Result<u64, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let parts: Vec<&str> = amount_str.split('.').collect();
    let (whole, frac) = match parts.len() {
        1 => (parts[0], ""),
        2 => {
            // Strict check: require both sides of the dot to be non-empty.
            // This prevents ambiguous formats like ".5" or "5."
            if parts[0].is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing leading zero (e.g., use 0.5 instead of .5)".into(),
                ));
            }
            if parts[1].is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
                ));
            }
            if decimals == 0 {
                return Err(MoneyError::InvalidFormat(
                    "decimals is 0, but dot provided".into(),
                ));
            }
            (parts[0], parts[1])
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    };

    // Precision validation: REJECT if too many decimals (no silent truncation!)
    if frac.len() > decimals as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: decimals,
        });
    }

    let whole_num: u64 = whole.parse::<u64>().map_err(|e| {
        let err_str = e.to_string();
        if err_str.contains("too large") || err_str.contains("overflow") {
            MoneyError::Overflow
        } else {
            MoneyError::InvalidFormat(format!("invalid character in whole part: {}", whole))
        }
    })?;

    let frac_num: u64 = if decimals == 0 || frac.is_empty() {
        0
    } else {
        let frac_padded = format!("{:0<width$}", frac, width = decimals as usize);
        frac_padded[..decimals as usize]
            .parse::<u64>()
            .map_err(|_| MoneyError::InvalidFormat("invalid fractional part".into()))?
    };

    let multiplier = 10u64.pow(decimals);
    let amount = whole_num
        .checked_mul(multiplier)
        .and_then(|v: u64| v.checked_add(frac_num))
        .ok_or(MoneyError::Overflow)?;

    if amount == 0 {
        return Err(MoneyError::InvalidAmount);
    }

    Ok(amount)
}

/// Convert a Decimal to internal u64 minor units
///
/// Used at the inbound boundary where `rust_decimal::Decimal` is used for
/// JSON deserialization.
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<u64, MoneyError> {
    if decimal.is_sign_negative() {
        return Err(MoneyError::InvalidAmount);
    }

    if decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    if decimal.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimal.scale(),
            max: decimals,
        });
    }

    let multiplier = Decimal::from(10u64.pow(decimals));
    let result = decimal * multiplier;

    // Should not have fractional part after scaling
    if !result.fract().is_zero() {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimal.scale(),
            max: decimals,
        });
    }

    result.to_u64().ok_or(MoneyError::Overflow)
}

/// Convert internal u64 minor units to a display string
pub fn format_amount(value: u64, decimals: u32, display_decimals: u32) -> String {
    let decimal_value = Decimal::from(value) / Decimal::from(10u64.pow(decimals));
    format!("{:.prec$}", decimal_value, prec = display_decimals as usize)
}

/// Convert internal u64 to a full precision string (for storage/transfer)
pub fn format_amount_full(value: u64, decimals: u32) -> String {
    format_amount(value, decimals, decimals)
}

/// Convert internal i64 to a display string (for signed deltas and net
/// settlement positions)
pub fn format_amount_signed(value: i64, decimals: u32, display_decimals: u32) -> String {
    let abs_value = value.unsigned_abs();
    let formatted = format_amount(abs_value, decimals, display_decimals);
    if value < 0 {
        format!("-{}", formatted)
    } else {
        formatted
    }
}
