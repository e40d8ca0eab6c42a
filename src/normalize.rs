//! Deterministic Decimal Normalization
//!
//! Converts textual decimal amounts into integer minor units. The conversion
//! must agree bit-for-bit with every other implementation of the gate, so the
//! rules are strict:
//! - Grammar: optional sign, integer digits, optional fraction
//! - Arbitrary-width intermediates (checked i128, narrowed on output)
//! - Safe-integer bound of +/-(2^53 - 1), never silently truncated
//! - Half-away-from-zero rounding in round mode
//!
//! This is a hot path component - runs on every priced tool call.

use serde::{Deserialize, Serialize};

use crate::{GateError, Result};

/// Largest magnitude representable without loss by every peer
/// implementation (2^53 - 1).
pub const SAFE_INT_MAX: i64 = 9_007_199_254_740_991;

/// What to do when the input carries more fractional digits than the
/// requested precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMode {
    /// Reject the value.
    Strict,
    /// Keep the first `precision` digits, round half-away-from-zero.
    Round,
    /// Keep the first `precision` digits, drop the rest.
    Truncate,
}

impl Default for NormalizeMode {
    fn default() -> Self {
        NormalizeMode::Strict
    }
}

/// Normalize a decimal string to an integer scaled by `10^precision`.
///
/// `"4.99"` at precision 2 becomes `499`. Inputs that do not match
/// `[+-]?\d+(\.\d+)?` after whitespace trimming fail with `invalid_numeric`;
/// any intermediate or final value outside the safe-integer range fails
/// with `overflow`.
pub fn normalize(input: &str, precision: u32, mode: NormalizeMode) -> Result<i64> {
    let trimmed = input.trim();
    let (negative, body) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (int_digits, frac_digits) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };

    if int_digits.is_empty() || !int_digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GateError::InvalidNumeric(input.trim().to_string()));
    }
    if body.contains('.') && (frac_digits.is_empty() || !frac_digits.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(GateError::InvalidNumeric(input.trim().to_string()));
    }

    let precision = precision as usize;
    let (kept_frac, round_up) = if frac_digits.len() > precision {
        match mode {
            NormalizeMode::Strict => {
                return Err(GateError::PrecisionExceeded {
                    digits: frac_digits.len(),
                    precision: precision as u32,
                })
            }
            NormalizeMode::Truncate => (&frac_digits[..precision], false),
            NormalizeMode::Round => (
                &frac_digits[..precision],
                frac_digits.as_bytes()[precision] >= b'5',
            ),
        }
    } else {
        (frac_digits, false)
    };

    // The scaled magnitude is the integer digits followed by the fraction
    // right-padded to `precision` zeros: int * 10^P + frac.
    let mut magnitude: i128 = 0;
    let pad = precision - kept_frac.len();
    let digits = int_digits.bytes().chain(kept_frac.bytes());
    for b in digits {
        magnitude = magnitude
            .checked_mul(10)
            .and_then(|m| m.checked_add((b - b'0') as i128))
            .ok_or(GateError::Overflow)?;
    }
    for _ in 0..pad {
        magnitude = magnitude.checked_mul(10).ok_or(GateError::Overflow)?;
    }
    if round_up {
        magnitude = magnitude.checked_add(1).ok_or(GateError::Overflow)?;
    }

    if magnitude > SAFE_INT_MAX as i128 {
        return Err(GateError::Overflow);
    }

    let value = magnitude as i64;
    Ok(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(normalize("1.00", 2, NormalizeMode::Strict).unwrap(), 100);
        assert!(matches!(
            normalize("1.005", 2, NormalizeMode::Strict),
            Err(GateError::PrecisionExceeded { .. })
        ));
        assert_eq!(normalize("1.005", 2, NormalizeMode::Round).unwrap(), 101);
        assert_eq!(normalize("1.005", 2, NormalizeMode::Truncate).unwrap(), 100);
        assert_eq!(normalize("-1.005", 2, NormalizeMode::Round).unwrap(), -101);
        assert_eq!(normalize("4.99", 2, NormalizeMode::Strict).unwrap(), 499);
        assert_eq!(normalize("0.00000001", 8, NormalizeMode::Strict).unwrap(), 1);
        assert_eq!(
            normalize("90071992547409.91", 2, NormalizeMode::Strict).unwrap(),
            9_007_199_254_740_991
        );
        assert!(matches!(
            normalize("90071992547409.92", 2, NormalizeMode::Strict),
            Err(GateError::Overflow)
        ));
    }

    #[test]
    fn test_grammar_rejections() {
        for bad in ["", ".", "1.", ".5", "1.2.3", "1e5", "abc", "1,00", "--1", "+-1", "1.0a"] {
            assert!(
                matches!(normalize(bad, 2, NormalizeMode::Strict), Err(GateError::InvalidNumeric(_))),
                "expected invalid_numeric for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_whitespace_and_sign() {
        assert_eq!(normalize("  42.50 ", 2, NormalizeMode::Strict).unwrap(), 4250);
        assert_eq!(normalize("+3.14", 2, NormalizeMode::Strict).unwrap(), 314);
        assert_eq!(normalize("-0.01", 2, NormalizeMode::Strict).unwrap(), -1);
    }

    #[test]
    fn test_zero_precision() {
        assert_eq!(normalize("17", 0, NormalizeMode::Strict).unwrap(), 17);
        assert!(normalize("17.5", 0, NormalizeMode::Strict).is_err());
        assert_eq!(normalize("17.5", 0, NormalizeMode::Round).unwrap(), 18);
        assert_eq!(normalize("17.4", 0, NormalizeMode::Truncate).unwrap(), 17);
    }

    #[test]
    fn test_round_is_half_away_from_zero() {
        assert_eq!(normalize("2.345", 2, NormalizeMode::Round).unwrap(), 235);
        assert_eq!(normalize("2.344", 2, NormalizeMode::Round).unwrap(), 234);
        assert_eq!(normalize("-2.345", 2, NormalizeMode::Round).unwrap(), -235);
        // Only the first excess digit decides the carry.
        assert_eq!(normalize("1.0049", 2, NormalizeMode::Round).unwrap(), 100);
    }

    #[test]
    fn test_strict_rejects_excess_zeros() {
        // Fraction longer than the precision fails even when the excess is zero.
        assert!(normalize("1.000", 2, NormalizeMode::Strict).is_err());
    }

    #[test]
    fn test_overflow_on_wide_input() {
        // Far wider than i128; checked arithmetic must reject, not wrap.
        let wide = "9".repeat(60);
        assert!(matches!(
            normalize(&wide, 2, NormalizeMode::Strict),
            Err(GateError::Overflow)
        ));
        assert!(matches!(
            normalize("9007199254740992", 0, NormalizeMode::Strict),
            Err(GateError::Overflow)
        ));
    }

    #[test]
    fn test_two_digit_roundtrip() {
        // normalize(n, 2, strict) followed by decimal division by 100
        // reproduces the input exactly for inputs with <= 2 fractional digits.
        for (text, cents) in [("0.01", 1), ("12.34", 1234), ("7", 700), ("-5.60", -560)] {
            let v = normalize(text, 2, NormalizeMode::Strict).unwrap();
            assert_eq!(v, cents);
            let whole = v / 100;
            let frac = (v % 100).abs();
            let rendered = if v < 0 && whole == 0 {
                format!("-{}.{:02}", whole.abs(), frac)
            } else {
                format!("{}.{:02}", whole, frac)
            };
            let again = normalize(&rendered, 2, NormalizeMode::Strict).unwrap();
            assert_eq!(again, v);
        }
    }
}
