//! Resource quantities and resource maps.
//!
//! A [`Quantity`] is a non-negative amount stored in milli-units, the same
//! way Kubernetes tracks `MilliValue()`: one CPU is `1000m`, one byte of
//! memory is `1000` milli-bytes. Storing everything in one integer unit
//! keeps reservation arithmetic exact across every dimension.
//!
//! A [`ResourceList`] maps dimension names (`cpu`, `memory`, `pods`, or any
//! extended resource such as `nvidia.com/gpu`) to quantities. It is a
//! `BTreeMap` so iteration order, and therefore everything derived from
//! it, is deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU dimension name.
pub const CPU: &str = "cpu";
/// Memory dimension name.
pub const MEMORY: &str = "memory";
/// Pod-count dimension name.
pub const PODS: &str = "pods";

const MILLI_PER_UNIT: u128 = 1000;
const KI: u128 = 1024;

/// Map from resource dimension name to quantity.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Errors produced while parsing a quantity string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("negative quantity: {0}")]
    Negative(String),

    #[error("invalid quantity: {0}")]
    Invalid(String),

    #[error("unknown quantity suffix {suffix:?} in {input}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("quantity out of range: {0}")]
    Overflow(String),
}

/// A non-negative resource amount in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "String")]
pub struct Quantity(u64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Build a quantity from milli-units (`500` → `500m`).
    pub const fn from_milli(milli: u64) -> Self {
        Self(milli)
    }

    /// Build a quantity from whole units (`2` CPUs, `1024` bytes).
    pub const fn from_units(units: u64) -> Self {
        Self(units.saturating_mul(MILLI_PER_UNIT as u64))
    }

    /// Build a memory quantity from mebibytes.
    pub const fn from_mebibytes(mib: u64) -> Self {
        Self::from_units(mib.saturating_mul(1024 * 1024))
    }

    /// Build a memory quantity from gibibytes.
    pub const fn from_gibibytes(gib: u64) -> Self {
        Self::from_units(gib.saturating_mul(1024 * 1024 * 1024))
    }

    pub const fn milli(self) -> u64 {
        self.0
    }

    /// Whole units, rounded up.
    pub const fn units_ceil(self) -> u64 {
        self.0.div_ceil(MILLI_PER_UNIT as u64)
    }

    /// Units as a float, for size heuristics only.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MILLI_PER_UNIT as f64
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_sub(other.0).map(Quantity)
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Quantity::saturating_add)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MILLI_PER_UNIT as u64 != 0 {
            return write!(f, "{}m", self.0);
        }
        let units = self.0 / MILLI_PER_UNIT as u64;
        if units == 0 {
            return write!(f, "0");
        }
        for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
            let factor = *factor as u64;
            if units >= factor && units % factor == 0 {
                return write!(f, "{}{}", units / factor, suffix);
            }
        }
        write!(f, "{units}")
    }
}

const BINARY_SUFFIXES: [(&str, u128); 5] = [
    ("Ki", KI),
    ("Mi", KI * KI),
    ("Gi", KI * KI * KI),
    ("Ti", KI * KI * KI * KI),
    ("Pi", KI * KI * KI * KI * KI),
];

/// Milli-units per one unit of the given suffix.
fn suffix_multiplier(suffix: &str) -> Option<u128> {
    let m = match suffix {
        "" => MILLI_PER_UNIT,
        "m" => 1,
        "k" => MILLI_PER_UNIT * 1_000,
        "M" => MILLI_PER_UNIT * 1_000_000,
        "G" => MILLI_PER_UNIT * 1_000_000_000,
        "T" => MILLI_PER_UNIT * 1_000_000_000_000,
        "P" => MILLI_PER_UNIT * 1_000_000_000_000_000,
        other => {
            let (_, factor) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == other)?;
            MILLI_PER_UNIT * factor
        }
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        if s.starts_with('-') {
            return Err(QuantityError::Negative(input.to_string()));
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
            input: input.to_string(),
            suffix: suffix.to_string(),
        })?;

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        // 18 fractional digits keeps 10^len inside u128 alongside the multiplier.
        if (whole.is_empty() && fraction.is_empty())
            || fraction.contains('.')
            || fraction.len() > 18
        {
            return Err(QuantityError::Invalid(input.to_string()));
        }

        let overflow = || QuantityError::Overflow(input.to_string());
        let whole_value: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut milli = whole_value.checked_mul(multiplier).ok_or_else(overflow)?;

        if !fraction.is_empty() {
            let digits: u128 = fraction
                .parse()
                .map_err(|_| QuantityError::Invalid(input.to_string()))?;
            let scale = 10u128.pow(fraction.len() as u32);
            let scaled = digits.checked_mul(multiplier).ok_or_else(overflow)?;
            milli = milli
                .checked_add(scaled.div_ceil(scale))
                .ok_or_else(overflow)?;
        }

        u64::try_from(milli).map(Quantity).map_err(|_| overflow())
    }
}

/// Wire form accepted for a quantity: `"4Gi"`, `"500m"` or a bare integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Text(String),
    Units(u64),
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = QuantityError;

    fn try_from(repr: QuantityRepr) -> Result<Self, Self::Error> {
        match repr {
            QuantityRepr::Text(s) => s.parse(),
            QuantityRepr::Units(units) => Ok(Quantity::from_units(units)),
        }
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

/// Look up a dimension, treating absence as zero.
pub fn quantity(list: &ResourceList, name: &str) -> Quantity {
    list.get(name).copied().unwrap_or_default()
}

/// Additive union of two resource lists.
///
/// Every dimension present in either list appears in the result; values
/// present in both are summed rather than replaced.
pub fn merge(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let mut merged = a.clone();
    for (name, value) in b {
        merged
            .entry(name.clone())
            .and_modify(|existing| *existing = existing.saturating_add(*value))
            .or_insert(*value);
    }
    merged
}

/// Parse `(name, quantity)` pairs into a resource list.
pub fn parse_list<'a, I>(pairs: I) -> Result<ResourceList, QuantityError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| Ok((name.to_string(), value.parse()?)))
        .collect()
}
