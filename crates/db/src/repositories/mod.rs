use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use bookdesk_core::domain::book::{Book, Isbn, SearchField};
use bookdesk_core::domain::customer::{Customer, CustomerId};
use bookdesk_core::domain::order::{NewOrderLine, OrderDetails, OrderId, OrderReceipt};
use bookdesk_core::domain::session::{Message, MessageRole, Session, SessionId, ToolCallRecord};
use bookdesk_core::errors::{ApplicationError, ToolError};

pub mod book;
pub mod customer;
pub mod order;
pub mod session;

pub use book::SqlBookRepository;
pub use customer::SqlCustomerRepository;
pub use order::SqlOrderRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// The store refused the operation for a domain reason; nothing was written.
    #[error(transparent)]
    Rejected(#[from] ToolError),
}

impl From<RepositoryError> for ToolError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Rejected(error) => error,
            other => ToolError::Store(other.to_string()),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Rejected(error) => ApplicationError::Tool(error),
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

/// Stock level of a book before and after a restock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockChange {
    pub old_stock: i64,
    pub new_stock: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceChange {
    pub old_price: Decimal,
    pub new_price: Decimal,
}

#[async_trait]
pub trait BookRepository: Send + Sync {
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError>;

    /// Case-insensitive substring match on one catalog column.
    async fn search(&self, query: &str, field: SearchField) -> Result<Vec<Book>, RepositoryError>;

    /// Returns `None` when no book has this ISBN.
    async fn restock(
        &self,
        isbn: &Isbn,
        quantity: i64,
    ) -> Result<Option<StockChange>, RepositoryError>;

    async fn update_price(
        &self,
        isbn: &Isbn,
        price: Decimal,
    ) -> Result<Option<PriceChange>, RepositoryError>;

    async fn below_stock(&self, threshold: i64) -> Result<Vec<Book>, RepositoryError>;
}

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, RepositoryError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Validates the request and, only if every check passes, writes the order, its
    /// items and the stock decrements in one transaction.
    async fn create(
        &self,
        customer_id: CustomerId,
        lines: &[NewOrderLine],
    ) -> Result<OrderReceipt, RepositoryError>;

    async fn find_details(&self, id: OrderId) -> Result<Option<OrderDetails>, RepositoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Creates the session if it does not exist yet and returns the stored row.
    async fn ensure(&self, id: &SessionId) -> Result<Session, RepositoryError>;

    async fn find(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn append_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, RepositoryError>;

    /// The newest `limit` messages of a session, oldest first.
    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, RepositoryError>;

    async fn list_tool_calls(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolCallRecord>, RepositoryError>;

    /// Persists the audit trail of a turn that ended without a reply and bumps the
    /// session's `updated_at`.
    async fn record_tool_calls(
        &self,
        session_id: &SessionId,
        tool_calls: &[ToolCallRecord],
    ) -> Result<(), RepositoryError>;

    /// Persists the tool audit trail and the assistant reply of a finished turn and
    /// bumps the session's `updated_at`, atomically.
    async fn complete_turn(
        &self,
        session_id: &SessionId,
        tool_calls: &[ToolCallRecord],
        reply: &str,
    ) -> Result<Message, RepositoryError>;
}

pub(crate) fn parse_decimal(column: &str, value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
