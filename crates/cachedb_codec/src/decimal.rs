//! Exact base-10 numbers.

use crate::error::{CodecError, CodecResult};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A decimal number `mantissa * 10^exponent`.
///
/// Values are kept normalized (no trailing zeros in the mantissa, zero has
/// exponent 0), so derived equality is numeric equality and every number has
/// exactly one encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i64,
    exponent: i32,
}

impl Decimal {
    /// Zero.
    pub const ZERO: Self = Self {
        mantissa: 0,
        exponent: 0,
    };

    /// Builds `mantissa * 10^exponent`, normalizing trailing zeros away.
    #[must_use]
    pub fn new(mut mantissa: i64, mut exponent: i32) -> Self {
        if mantissa == 0 {
            return Self::ZERO;
        }
        while mantissa % 10 == 0 && exponent < i32::MAX {
            mantissa /= 10;
            exponent += 1;
        }
        Self { mantissa, exponent }
    }

    /// Builds an integral decimal.
    #[must_use]
    pub fn from_integer(value: i64) -> Self {
        Self::new(value, 0)
    }

    /// Significand after normalization.
    #[must_use]
    pub const fn mantissa(&self) -> i64 {
        self.mantissa
    }

    /// Power-of-ten exponent after normalization.
    #[must_use]
    pub const fn exponent(&self) -> i32 {
        self.exponent
    }

    /// True when strictly greater than zero.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.mantissa > 0
    }

    /// True when strictly less than zero.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    /// Lossy conversion for display and arithmetic outside the store.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exponent)
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.mantissa.signum().cmp(&other.mantissa.signum()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Same sign: bring both to the smaller exponent in i128.
        let shift = self.exponent.min(other.exponent);
        let scale = |d: &Decimal| -> Option<i128> {
            let diff = u32::try_from(i64::from(d.exponent) - i64::from(shift)).ok()?;
            10i128
                .checked_pow(diff)
                .and_then(|p| p.checked_mul(i128::from(d.mantissa)))
        };
        match (scale(self), scale(other)) {
            (Some(a), Some(b)) => a.cmp(&b),
            // Overflow means a magnitude beyond i128; larger exponent wins
            _ => {
                let by_exp = self.exponent.cmp(&other.exponent);
                if self.mantissa < 0 {
                    by_exp.reverse()
                } else {
                    by_exp
                }
            }
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent >= 0 {
            write!(f, "{}", self.mantissa)?;
            for _ in 0..self.exponent {
                f.write_str("0")?;
            }
            return Ok(());
        }
        let digits = self.mantissa.unsigned_abs().to_string();
        let frac = self.exponent.unsigned_abs() as usize;
        if self.mantissa < 0 {
            f.write_str("-")?;
        }
        if digits.len() > frac {
            let (int, rest) = digits.split_at(digits.len() - frac);
            write!(f, "{int}.{rest}")
        } else {
            write!(f, "0.{}{digits}", "0".repeat(frac - digits.len()))
        }
    }
}

impl FromStr for Decimal {
    type Err = CodecError;

    fn from_str(s: &str) -> CodecResult<Self> {
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(CodecError::invalid_decimal(format!("no digits in {s:?}")));
        }
        if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(CodecError::invalid_decimal(format!("not a number: {s:?}")));
        }
        let mut mantissa: i64 = 0;
        for b in int.bytes().chain(frac.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i64::from(b - b'0')))
                .ok_or_else(|| CodecError::invalid_decimal(format!("too many digits: {s:?}")))?;
        }
        if negative {
            mantissa = -mantissa;
        }
        let exponent = i32::try_from(frac.len())
            .map(|n| -n)
            .map_err(|_| CodecError::invalid_decimal("fraction too long"))?;
        Ok(Self::new(mantissa, exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_makes_equal_numbers_equal() {
        assert_eq!(Decimal::new(1500, -3), Decimal::new(15, -1));
        assert_eq!(Decimal::new(0, 7), Decimal::ZERO);
        assert_eq!(Decimal::new(1500, -3).mantissa(), 15);
    }

    #[test]
    fn parses_and_displays() {
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(d, Decimal::new(125, -1));
        assert_eq!(d.to_string(), "12.5");
        assert_eq!("-0.05".parse::<Decimal>().unwrap().to_string(), "-0.05");
        assert_eq!("300".parse::<Decimal>().unwrap().to_string(), "300");
        assert_eq!(".5".parse::<Decimal>().unwrap().to_string(), "0.5");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Decimal>().is_err());
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("1e5".parse::<Decimal>().is_err());
        assert!("99999999999999999999".parse::<Decimal>().is_err());
    }

    #[test]
    fn ordering_is_numeric() {
        let a: Decimal = "1.9".parse().unwrap();
        let b: Decimal = "10".parse().unwrap();
        let c: Decimal = "-3".parse().unwrap();
        assert!(a < b);
        assert!(c < a);
        assert!(Decimal::new(-1, 30) < Decimal::new(-1, 2));
        assert!(Decimal::new(1, 30) > Decimal::new(9, 2));
    }
}
