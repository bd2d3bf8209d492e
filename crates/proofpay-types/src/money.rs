//! Money helpers
//!
//! Amounts are carried as [`Decimal`] so that sums and equality checks are
//! exact. Currencies are upper-case ISO-4217 style codes.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::{Result, TypesError};

/// Normalize a currency code (trimmed, upper-case, 3-10 alphanumerics)
pub fn normalize_currency(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if trimmed.len() < 3
        || trimmed.len() > 10
        || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(TypesError::InvalidCurrency(code.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Compare two currency codes case-insensitively
pub fn same_currency(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Read an exact decimal from a JSON number or numeric string.
///
/// Numbers go through their textual form so `150.10` stays `150.10`
/// instead of picking up binary float noise.
pub fn decimal_from_json(value: &Value) -> Result<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|e| TypesError::InvalidAmount(format!("{n}: {e}"))),
        Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| TypesError::InvalidAmount(format!("{s:?}: {e}"))),
        other => Err(TypesError::InvalidAmount(format!(
            "expected number, got {}",
            json_type_name(other)
        ))),
    }
}

/// Human-readable JSON type name, used in error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Sum a sequence of amounts
pub fn sum_amounts<'a>(amounts: impl IntoIterator<Item = &'a Decimal>) -> Decimal {
    amounts.into_iter().fold(Decimal::ZERO, |acc, a| acc + *a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency(" usd ").unwrap(), "USD");
        assert!(normalize_currency("").is_err());
        assert!(normalize_currency("U$").is_err());
    }

    #[test]
    fn test_decimal_from_json_number_and_string() {
        assert_eq!(decimal_from_json(&json!(150)).unwrap(), dec!(150));
        assert_eq!(decimal_from_json(&json!(150.10)).unwrap(), dec!(150.10));
        assert_eq!(decimal_from_json(&json!("99.99")).unwrap(), dec!(99.99));
        assert!(decimal_from_json(&json!(true)).is_err());
        assert!(decimal_from_json(&json!("abc")).is_err());
    }

    #[test]
    fn test_sum_amounts() {
        let amounts = [dec!(150), dec!(150), dec!(0.5)];
        assert_eq!(sum_amounts(&amounts), dec!(300.5));
    }
}
