use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monetary amount in the slip's own currency, held at two decimal places.
///
/// Currency is never tracked: markers on the slip only help locate the figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub fn from_decimal(decimal: Decimal) -> Self {
        Money(decimal.round_dp(2))
    }

    /// Lenient parse for caller-supplied amounts: everything except digits,
    /// `.` and `-` is dropped first, so `"MVR 1,250.00"` reads as `1250.00`.
    /// Empty or still-unparsable input yields `None`.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let clean: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        if clean.is_empty() {
            return None;
        }
        Decimal::from_str(&clean).ok().map(Money::from_decimal)
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn abs_diff(self, other: Money) -> Decimal {
        (self.0 - other.0).abs()
    }

    /// True when the two amounts differ by at most `tolerance` (inclusive).
    pub fn within(self, other: Money, tolerance: Decimal) -> bool {
        self.abs_diff(other) <= tolerance
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl From<Decimal> for Money {
    fn from(decimal: Decimal) -> Self {
        Money::from_decimal(decimal)
    }
}
