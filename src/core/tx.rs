use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core::Transaction;
use crate::error::ValidationError;

/// Fixed decimal count of the monitored token.
pub const TOKEN_DECIMALS: u32 = 6;

/// Parse a base-unit integer written as decimal digits or `0x` hex.
pub fn parse_base_units(raw: &str) -> Option<u128> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => u128::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None => raw.parse::<u128>().ok(),
    }
}

/// Scale base units to a human amount. `None` if the value does not fit a Decimal.
pub fn scale_base_units(base_units: u128) -> Option<Decimal> {
    let mantissa = i128::try_from(base_units).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, TOKEN_DECIMALS)
        .ok()
        .map(|d| d.normalize())
}

pub fn timestamp_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Structural checks applied to every parsed transaction before emission.
pub fn validate(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.hash.is_empty() {
        return Err(ValidationError::EmptyHash);
    }
    if tx.from.is_empty() {
        return Err(ValidationError::EmptySender);
    }
    if tx.to.is_empty() {
        return Err(ValidationError::EmptyRecipient);
    }
    if tx.amount < Decimal::ZERO {
        return Err(ValidationError::NegativeAmount(tx.amount));
    }
    if tx.block_number == 0 {
        return Err(ValidationError::ZeroBlock);
    }
    if tx.timestamp.timestamp_millis() == 0 {
        return Err(ValidationError::ZeroTimestamp);
    }
    Ok(())
}
