use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::book::Isbn;
use crate::domain::customer::Customer;
use crate::errors::ToolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One requested line of a `create_order` call, as supplied by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub isbn: Isbn,
    #[serde(rename = "qty")]
    pub quantity: i64,
}

/// Checks the shape of a requested order and folds repeated ISBNs into a single
/// quantity, preserving first-seen order. Performs no store access.
pub fn consolidate_lines(lines: &[NewOrderLine]) -> Result<Vec<NewOrderLine>, ToolError> {
    if lines.is_empty() {
        return Err(ToolError::InvalidInput("order must contain at least one item".to_string()));
    }

    let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
    let mut consolidated: Vec<NewOrderLine> = Vec::with_capacity(lines.len());

    for line in lines {
        let isbn = line.isbn.as_str().trim();
        if isbn.is_empty() || line.quantity <= 0 {
            return Err(ToolError::InvalidInput(
                "Invalid item format. Need 'isbn' and 'qty' > 0".to_string(),
            ));
        }

        match positions.get(isbn) {
            Some(&index) => {
                let merged = &mut consolidated[index];
                merged.quantity = merged.quantity.checked_add(line.quantity).ok_or_else(|| {
                    ToolError::InvalidInput(format!("quantity for ISBN {isbn} is too large"))
                })?;
            }
            None => {
                positions.insert(isbn, consolidated.len());
                consolidated
                    .push(NewOrderLine { isbn: Isbn(isbn.to_string()), quantity: line.quantity });
            }
        }
    }

    Ok(consolidated)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub isbn: Isbn,
    pub title: String,
    pub author: String,
    pub quantity: i64,
    pub price_at_purchase: Decimal,
}

impl OrderItem {
    pub fn line_total(&self) -> Result<Decimal, ToolError> {
        line_amount(self.price_at_purchase, self.quantity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub id: OrderId,
    pub customer: Customer,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl OrderDetails {
    /// Sum of `quantity * price_at_purchase`; the book's current price is never consulted.
    pub fn total(&self) -> Result<Decimal, ToolError> {
        sum_lines(self.items.iter().map(|item| (item.price_at_purchase, item.quantity)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub isbn: Isbn,
    pub title: String,
    pub quantity_ordered: i64,
    pub price_at_purchase: Decimal,
    pub new_stock: i64,
}

/// Outcome of a committed order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub customer: Customer,
    pub items: Vec<ReceiptLine>,
}

impl OrderReceipt {
    pub fn total(&self) -> Result<Decimal, ToolError> {
        sum_lines(self.items.iter().map(|line| (line.price_at_purchase, line.quantity_ordered)))
    }
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp(2)
}

fn line_amount(price: Decimal, quantity: i64) -> Result<Decimal, ToolError> {
    price.checked_mul(Decimal::from(quantity)).ok_or_else(amount_too_large)
}

fn sum_lines(lines: impl Iterator<Item = (Decimal, i64)>) -> Result<Decimal, ToolError> {
    let mut total = Decimal::ZERO;
    for (price, quantity) in lines {
        total = total.checked_add(line_amount(price, quantity)?).ok_or_else(amount_too_large)?;
    }
    Ok(round_money(total))
}

fn amount_too_large() -> ToolError {
    ToolError::InvalidInput("Order total exceeds the largest supported amount".to_string())
}
