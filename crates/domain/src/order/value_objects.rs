//! Value objects for the order domain.

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Money amount in cents, so totals never suffer float rounding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Whole units, truncated toward zero.
    pub fn dollars(&self) -> i64 {
        self.0 / 100
    }

    /// The cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.0.abs() % 100
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Saturates at the `i64` bounds.
    pub fn multiply(&self, quantity: u64) -> Money {
        let quantity = i64::try_from(quantity).unwrap_or(i64::MAX);
        Money(self.0.saturating_mul(quantity))
    }

    /// `None` when the product does not fit.
    pub fn checked_multiply(&self, quantity: u64) -> Option<Money> {
        let quantity = i64::try_from(quantity).ok()?;
        self.0.checked_mul(quantity).map(Money)
    }

    pub fn checked_add(&self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{sign}${}.{:02}", self.dollars().abs(), self.cents_part())
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

/// A line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub quantity: u64,
    /// Price per unit.
    pub price: Money,
}

impl ShopItem {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        quantity: u64,
        price: Money,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            quantity,
            price,
        }
    }

    pub fn total_price(&self) -> Money {
        self.price.multiply(self.quantity)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::Blank("shop item id"));
        }
        if self.quantity == 0 {
            return Err(ValidationError::ZeroQuantity {
                item_id: self.id.clone(),
            });
        }
        if i64::try_from(self.quantity).is_err() {
            return Err(ValidationError::QuantityTooLarge {
                item_id: self.id.clone(),
                quantity: self.quantity,
            });
        }
        if self.price.is_negative() {
            return Err(ValidationError::NegativePrice {
                item_id: self.id.clone(),
                price_cents: self.price.cents(),
            });
        }
        Ok(())
    }
}

/// Validates a full item list and returns its total.
pub(crate) fn validate_items(items: &[ShopItem]) -> Result<Money, ValidationError> {
    if items.is_empty() {
        return Err(ValidationError::NoItems);
    }
    let mut total = Money::zero();
    for item in items {
        item.validate()?;
        total = item
            .price
            .checked_multiply(item.quantity)
            .and_then(|line| total.checked_add(line))
            .ok_or(ValidationError::TotalOverflow)?;
    }
    Ok(total)
}

pub(crate) fn total_price(items: &[ShopItem]) -> Money {
    items.iter().map(ShopItem::total_price).sum()
}

/// Email address of the account that placed the order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountEmail(String);

impl AccountEmail {
    /// Accepts `local@domain.tld` shapes without whitespace.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let email = raw.trim();
        let invalid = || ValidationError::InvalidEmail(raw.to_string());

        let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
        let well_formed = !local.is_empty()
            && !domain.contains('@')
            && !email.chars().any(char::is_whitespace)
            && domain
                .split_once('.')
                .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
            && !domain.ends_with('.');

        if !well_formed {
            return Err(invalid());
        }
        Ok(Self(email.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
