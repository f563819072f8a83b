use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::str::FromStr;

use malachite::Natural;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Address;

/// Arbitrary-precision non-negative balance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount {
    inner: Natural,
}

impl Amount {
    pub fn zero() -> Self {
        Self {
            inner: Natural::from(0u32),
        }
    }

    pub fn from_natural(inner: Natural) -> Self {
        Self { inner }
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn as_natural(&self) -> &Natural {
        &self.inner
    }

    pub fn is_zero(&self) -> bool {
        self.inner == Natural::from(0u32)
    }

    pub fn add_assign(&mut self, other: &Amount) {
        self.inner.add_assign(other.inner.clone());
    }

    /// Subtracts without going negative; callers check sufficiency first.
    pub fn saturating_sub(&mut self, other: &Amount) {
        if self.inner >= other.inner {
            self.inner.sub_assign(other.inner.clone());
        } else {
            self.inner = Natural::from(0u32);
        }
    }

    /// Truncated integer division; zero divisor yields zero.
    pub fn div_floor(&self, divisor: u64) -> Amount {
        if divisor == 0 {
            return Amount::zero();
        }
        Amount::from_natural(self.inner.clone() / Natural::from(divisor))
    }

    /// Absolute difference between two amounts.
    pub fn abs_diff(&self, other: &Amount) -> Amount {
        if self.inner >= other.inner {
            Amount::from_natural(self.inner.clone() - other.inner.clone())
        } else {
            Amount::from_natural(other.inner.clone() - self.inner.clone())
        }
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for Amount {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Natural::from_str(s).map(Amount::from_natural)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.inner.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Natural::from_str(&value)
            .map(Amount::from_natural)
            .map_err(|_| serde::de::Error::custom("invalid amount value"))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: Amount,
    pub nonce: u64,
}

impl Account {
    pub fn new(address: Address, balance: Amount) -> Self {
        Self {
            address,
            balance,
            nonce: 0,
        }
    }

    pub fn credit(&mut self, amount: &Amount) {
        self.balance.add_assign(amount);
    }

    pub fn debit(&mut self, amount: &Amount) -> bool {
        if self.balance >= *amount {
            self.balance.saturating_sub(amount);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_refuses_overdraw() {
        let mut account = Account::new("aa".repeat(20), Amount::from_u64(10));
        assert!(!account.debit(&Amount::from_u64(11)));
        assert_eq!(account.balance, Amount::from_u64(10));
        assert!(account.debit(&Amount::from_u64(4)));
        assert_eq!(account.balance, Amount::from_u64(6));
    }

    #[test]
    fn amount_division_truncates() {
        let fee = Amount::from_u64(10);
        assert_eq!(fee.div_floor(3), Amount::from_u64(3));
        assert_eq!(fee.div_floor(0), Amount::zero());
    }
}
