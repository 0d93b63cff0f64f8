use std::fmt;
use std::str::FromStr;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::core::error::{Error, ErrorKind, Result};

/// Exact fixed-point number with four fractional digits.
///
/// Money amounts are summed by reduce functions in arbitrary order, so the
/// representation has to be associative; binary floating point is not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Decimal(i64);

impl Decimal {
    pub const SCALE_DIGITS: u32 = 4;
    pub const SCALE: i64 = 10_000;
    pub const ZERO: Decimal = Decimal(0);

    pub fn from_units(units: i64) -> Self {
        Decimal(units)
    }

    pub fn units(&self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        value
            .checked_mul(Self::SCALE)
            .map(Decimal)
            .ok_or_else(|| overflow("from_i64"))
    }

    /// Rounds to the nearest representable value.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::new(ErrorKind::InvalidArgument, format!("{} is not a finite number", value)));
        }
        let scaled = (value * Self::SCALE as f64).round();
        if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
            return Err(overflow("from_f64"));
        }
        Ok(Decimal(scaled as i64))
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn checked_add(self, other: Decimal) -> Result<Decimal> {
        self.0.checked_add(other.0).map(Decimal).ok_or_else(|| overflow("add"))
    }

    pub fn checked_sub(self, other: Decimal) -> Result<Decimal> {
        self.0.checked_sub(other.0).map(Decimal).ok_or_else(|| overflow("sub"))
    }

    pub fn checked_mul_int(self, factor: i64) -> Result<Decimal> {
        self.0.checked_mul(factor).map(Decimal).ok_or_else(|| overflow("mul"))
    }

    /// Sums an iterator, failing on the first overflow.
    pub fn checked_sum<I: IntoIterator<Item = Decimal>>(values: I) -> Result<Decimal> {
        values.into_iter().try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
    }
}

fn overflow(op: &str) -> Error {
    Error::new(ErrorKind::InvalidArgument, format!("decimal overflow in {}", op))
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::Parse, format!("invalid decimal '{}'", s));
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > Self::SCALE_DIGITS as usize {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("decimal '{}' has more than {} fractional digits", s, Self::SCALE_DIGITS),
            ));
        }

        let whole_value: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        let mut frac_value: i64 = if frac.is_empty() { 0 } else { frac.parse().map_err(|_| invalid())? };
        for _ in frac.len()..Self::SCALE_DIGITS as usize {
            frac_value *= 10;
        }

        let units = whole_value
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac_value))
            .ok_or_else(|| overflow("parse"))?;
        Ok(Decimal(if negative { -units } else { units }))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        let whole = abs / scale;
        let frac = abs % scale;
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let frac_str = format!("{:04}", frac);
        write!(f, "{}{}.{}", sign, whole, frac_str.trim_end_matches('0'))
    }
}

impl From<i32> for Decimal {
    fn from(value: i32) -> Self {
        Decimal(value as i64 * Self::SCALE)
    }
}

// Human readable formats (JSON) get a string so no precision is lost on the
// way through f64; binary formats get the raw units.
impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_i64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(DecimalVisitor)
        } else {
            i64::deserialize(deserializer).map(Decimal)
        }
    }
}

struct DecimalVisitor;

impl<'de> Visitor<'de> for DecimalVisitor {
    type Value = Decimal;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a decimal number or decimal string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Decimal, E> {
        v.parse().map_err(|e: Error| E::custom(e.context))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Decimal, E> {
        Decimal::from_i64(v).map_err(|e| E::custom(e.context))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Decimal, E> {
        let signed = i64::try_from(v).map_err(|_| E::custom("decimal overflow"))?;
        self.visit_i64(signed)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Decimal, E> {
        Decimal::from_f64(v).map_err(|e| E::custom(e.context))
    }
}
