use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use crate::core::decimal::Decimal;
use crate::core::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        DocId(id.to_string())
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        DocId(id)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Global mutation sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Etag(pub u64);

impl Etag {
    pub const ZERO: Etag = Etag(0);

    pub fn next(&self) -> Etag {
        Etag(self.0 + 1)
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub collection: String,
    pub body: serde_json::Value,
    pub etag: Etag,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    pub fn is_in(&self, collection: &str) -> bool {
        self.collection == collection
    }

    /// Deserialize the body into a typed entity.
    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A typed document payload stored under a fixed collection.
pub trait Entity: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Decimal(Decimal),
    Text(String),
}

impl FieldValue {
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Integer(i) => Decimal::from_i64(*i).ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Number(n) => Some(*n),
            FieldValue::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Boolean(_) => 1,
            FieldValue::Integer(_) | FieldValue::Number(_) | FieldValue::Decimal(_) => 2,
            FieldValue::Text(_) => 3,
        }
    }

    /// Total order used for sorting and filtering rows.
    ///
    /// Null < Boolean < numbers < Text. Integer and Decimal compare exactly
    /// with each other; anything involving a float goes through `total_cmp`.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a.cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => a.cmp(b),
            (FieldValue::Integer(_), FieldValue::Decimal(_))
            | (FieldValue::Decimal(_), FieldValue::Integer(_)) => {
                match (self.as_decimal(), other.as_decimal()) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    _ => self.float_cmp(other),
                }
            }
            _ if self.rank() == 2 && other.rank() == 2 => self.float_cmp(other),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn float_cmp(&self, other: &FieldValue) -> Ordering {
        let a = self.as_f64().unwrap_or(f64::NAN);
        let b = other.as_f64().unwrap_or(f64::NAN);
        a.total_cmp(&b)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// Named values of an emitted or reduced row.
pub type Row = BTreeMap<String, FieldValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_across_variants() {
        let int = FieldValue::Integer(18);
        let dec = FieldValue::Decimal(Decimal::from(18));
        let float = FieldValue::Number(18.5);
        assert_eq!(int.sort_cmp(&dec), Ordering::Equal);
        assert_eq!(dec.sort_cmp(&float), Ordering::Less);
        assert_eq!(float.sort_cmp(&int), Ordering::Greater);
    }

    #[test]
    fn variants_rank_before_comparison() {
        assert_eq!(FieldValue::Null.sort_cmp(&FieldValue::Boolean(false)), Ordering::Less);
        assert_eq!(FieldValue::Integer(i64::MAX).sort_cmp(&FieldValue::from("a")), Ordering::Less);
        assert_eq!(FieldValue::from("b").sort_cmp(&FieldValue::from("a")), Ordering::Greater);
    }
}
