use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use bookdesk_core::domain::book::Isbn;
use bookdesk_core::domain::customer::{Customer, CustomerId};
use bookdesk_core::domain::order::{
    consolidate_lines, NewOrderLine, OrderDetails, OrderId, OrderItem, OrderReceipt, OrderStatus,
    ReceiptLine,
};
use bookdesk_core::errors::ToolError;

use super::{
    parse_decimal, parse_timestamp, CustomerRepository, OrderRepository, RepositoryError,
    SqlCustomerRepository,
};
use crate::DbPool;

pub struct SqlOrderRepository {
    pool: DbPool,
    customers: SqlCustomerRepository,
}

impl SqlOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { customers: SqlCustomerRepository::new(pool.clone()), pool }
    }

    async fn require_customer(&self, id: CustomerId) -> Result<Customer, RepositoryError> {
        self.customers
            .find_by_id(id)
            .await?
            .ok_or_else(|| ToolError::NotFound(format!("Customer ID {id} not found")).into())
    }

    /// Read-only pass over every line so a bad request never opens a write transaction.
    async fn check_availability(&self, lines: &[NewOrderLine]) -> Result<(), RepositoryError> {
        for line in lines {
            let row: Option<(String, i64)> =
                sqlx::query_as("SELECT title, stock FROM books WHERE isbn = ?")
                    .bind(line.isbn.as_str())
                    .fetch_optional(&self.pool)
                    .await?;

            let Some((title, available)) = row else {
                return Err(book_not_found(&line.isbn).into());
            };
            if available < line.quantity {
                return Err(ToolError::InsufficientStock {
                    isbn: line.isbn.0.clone(),
                    title,
                    available,
                    requested: line.quantity,
                }
                .into());
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl OrderRepository for SqlOrderRepository {
    async fn create(
        &self,
        customer_id: CustomerId,
        lines: &[NewOrderLine],
    ) -> Result<OrderReceipt, RepositoryError> {
        let lines = consolidate_lines(lines)?;
        let customer = self.require_customer(customer_id).await?;
        self.check_availability(&lines).await?;

        // Writing the order row first takes the database write lock before any
        // stock is read inside the transaction.
        let mut tx = self.pool.begin().await?;
        let order_id: i64 = sqlx::query_scalar(
            "INSERT INTO orders (customer_id, status, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(customer_id.0)
        .bind(OrderStatus::Completed.as_str())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let decremented = sqlx::query(
                "UPDATE books SET stock = stock - ?1
                 WHERE isbn = ?2 AND stock >= ?1
                 RETURNING title, price, stock",
            )
            .bind(line.quantity)
            .bind(line.isbn.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = decremented else {
                // Stock moved since the availability check; dropping `tx` rolls back.
                let current: Option<(String, i64)> =
                    sqlx::query_as("SELECT title, stock FROM books WHERE isbn = ?")
                        .bind(line.isbn.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                let rejection = match current {
                    Some((title, available)) => ToolError::InsufficientStock {
                        isbn: line.isbn.0.clone(),
                        title,
                        available,
                        requested: line.quantity,
                    },
                    None => book_not_found(&line.isbn),
                };
                debug!(
                    event_name = "db.order.rolled_back",
                    isbn = %line.isbn,
                    reason = rejection.kind(),
                    "order transaction rolled back"
                );
                return Err(rejection.into());
            };

            let price_at_purchase = parse_decimal("price", &row.try_get::<String, _>("price")?)?;
            sqlx::query(
                "INSERT INTO order_items (order_id, isbn, quantity, price_at_purchase)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(order_id)
            .bind(line.isbn.as_str())
            .bind(line.quantity)
            .bind(price_at_purchase.to_string())
            .execute(&mut *tx)
            .await?;

            items.push(ReceiptLine {
                isbn: line.isbn.clone(),
                title: row.try_get("title")?,
                quantity_ordered: line.quantity,
                price_at_purchase,
                new_stock: row.try_get("stock")?,
            });
        }

        let receipt = OrderReceipt { order_id: OrderId(order_id), customer, items };
        if let Err(rejection) = receipt.total() {
            debug!(
                event_name = "db.order.rolled_back",
                order_id,
                reason = rejection.kind(),
                "order total out of range; transaction rolled back"
            );
            return Err(rejection.into());
        }

        tx.commit().await?;
        Ok(receipt)
    }

    async fn find_details(&self, id: OrderId) -> Result<Option<OrderDetails>, RepositoryError> {
        let header = sqlx::query(
            "SELECT
                o.id,
                o.status,
                o.created_at,
                c.id AS customer_id,
                c.name AS customer_name,
                c.email AS customer_email
             FROM orders o
             JOIN customers c ON c.id = o.customer_id
             WHERE o.id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT oi.isbn, b.title, b.author, oi.quantity, oi.price_at_purchase
             FROM order_items oi
             JOIN books b ON b.isbn = oi.isbn
             WHERE oi.order_id = ?
             ORDER BY oi.id ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(|row| {
                let price_raw = row.try_get::<String, _>("price_at_purchase")?;
                Ok(OrderItem {
                    isbn: Isbn(row.try_get("isbn")?),
                    title: row.try_get("title")?,
                    author: row.try_get("author")?,
                    quantity: row.try_get("quantity")?,
                    price_at_purchase: parse_decimal("price_at_purchase", &price_raw)?,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(Some(OrderDetails {
            id: OrderId(header.try_get("id")?),
            customer: Customer {
                id: CustomerId(header.try_get("customer_id")?),
                name: header.try_get("customer_name")?,
                email: header.try_get("customer_email")?,
            },
            status: parse_status(&header.try_get::<String, _>("status")?)?,
            created_at: parse_timestamp("created_at", header.try_get("created_at")?)?,
            items,
        }))
    }
}

fn parse_status(value: &str) -> Result<OrderStatus, RepositoryError> {
    OrderStatus::parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("invalid order status in `status`: `{value}`")))
}

fn book_not_found(isbn: &Isbn) -> ToolError {
    ToolError::NotFound(format!("Book with ISBN {isbn} not found"))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use bookdesk_core::domain::book::Isbn;
    use bookdesk_core::domain::customer::CustomerId;
    use bookdesk_core::domain::order::{NewOrderLine, OrderId, OrderStatus};
    use bookdesk_core::errors::ToolError;

    use super::SqlOrderRepository;
    use crate::repositories::test_support::seeded_pool;
    use crate::repositories::{
        BookRepository, OrderRepository, RepositoryError, SqlBookRepository,
    };
    use crate::DbPool;

    const CLEAN_CODE: &str = "978-0132350884";
    const CLEAN_CODER: &str = "978-0137081073";

    fn line(isbn: &str, quantity: i64) -> NewOrderLine {
        NewOrderLine { isbn: Isbn(isbn.to_string()), quantity }
    }

    async fn stock_of(pool: &DbPool, isbn: &str) -> i64 {
        SqlBookRepository::new(pool.clone())
            .find_by_isbn(&Isbn(isbn.to_string()))
            .await
            .expect("find book")
            .expect("book exists")
            .stock
    }

    async fn order_count(pool: &DbPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM orders").fetch_one(pool).await.expect("count")
    }

    #[tokio::test]
    async fn create_decrements_stock_and_captures_prices() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        let receipt = repo
            .create(CustomerId(1), &[line(CLEAN_CODE, 2), line(CLEAN_CODER, 1)])
            .await
            .expect("create order");

        assert_eq!(receipt.customer.name, "Ada Lovelace");
        assert_eq!(receipt.items.len(), 2);
        assert_eq!(receipt.items[0].new_stock, 23);
        assert_eq!(receipt.items[1].new_stock, 2);
        assert_eq!(receipt.total(), Ok(Decimal::new(11497, 2)));
        assert_eq!(stock_of(&pool, CLEAN_CODE).await, 23);

        let details =
            repo.find_details(receipt.order_id).await.expect("details").expect("order exists");
        assert_eq!(details.status, OrderStatus::Completed);
        assert_eq!(details.total(), receipt.total());

        pool.close().await;
    }

    #[tokio::test]
    async fn insufficient_stock_leaves_store_untouched() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());
        let orders_before = order_count(&pool).await;

        let error = repo
            .create(CustomerId(1), &[line(CLEAN_CODE, 1), line(CLEAN_CODER, 4)])
            .await
            .expect_err("should fail");

        assert!(matches!(
            error,
            RepositoryError::Rejected(ToolError::InsufficientStock { available: 3, requested: 4, .. })
        ));
        assert_eq!(stock_of(&pool, CLEAN_CODE).await, 25);
        assert_eq!(stock_of(&pool, CLEAN_CODER).await, 3);
        assert_eq!(order_count(&pool).await, orders_before);

        pool.close().await;
    }

    #[tokio::test]
    async fn repeated_isbns_are_checked_against_stock_in_aggregate() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        let error = repo
            .create(CustomerId(2), &[line(CLEAN_CODER, 2), line(CLEAN_CODER, 2)])
            .await
            .expect_err("aggregate exceeds stock");
        assert!(matches!(
            error,
            RepositoryError::Rejected(ToolError::InsufficientStock { requested: 4, .. })
        ));
        assert_eq!(stock_of(&pool, CLEAN_CODER).await, 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_customer_or_book_is_not_found() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        let error = repo.create(CustomerId(404), &[line(CLEAN_CODE, 1)]).await.expect_err("customer");
        assert!(matches!(
            error,
            RepositoryError::Rejected(ToolError::NotFound(ref message)) if message == "Customer ID 404 not found"
        ));

        let error = repo.create(CustomerId(1), &[line("999", 1)]).await.expect_err("book");
        assert!(matches!(
            error,
            RepositoryError::Rejected(ToolError::NotFound(ref message)) if message == "Book with ISBN 999 not found"
        ));

        pool.close().await;
    }

    #[tokio::test]
    async fn invalid_lines_are_rejected_before_lookup() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        let error = repo.create(CustomerId(404), &[]).await.expect_err("empty order");
        assert!(matches!(error, RepositoryError::Rejected(ToolError::InvalidInput(_))));

        let error = repo.create(CustomerId(1), &[line(CLEAN_CODE, 0)]).await.expect_err("zero qty");
        assert!(matches!(error, RepositoryError::Rejected(ToolError::InvalidInput(_))));

        pool.close().await;
    }

    #[tokio::test]
    async fn order_total_ignores_later_price_changes() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());
        let books = SqlBookRepository::new(pool.clone());

        let receipt = repo.create(CustomerId(3), &[line(CLEAN_CODE, 3)]).await.expect("create");
        books
            .update_price(&Isbn(CLEAN_CODE.to_string()), Decimal::new(100, 0))
            .await
            .expect("update price");

        let details =
            repo.find_details(receipt.order_id).await.expect("details").expect("order exists");
        assert_eq!(details.total(), Ok(Decimal::new(11997, 2)));

        pool.close().await;
    }

    #[tokio::test]
    async fn seeded_order_details_join_customer_and_books() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        let details = repo.find_details(OrderId(1)).await.expect("details").expect("seeded order");
        assert_eq!(details.customer.email, "ada@example.com");
        assert_eq!(details.items[0].title, "Clean Code");
        assert_eq!(details.items[0].author, "Robert C. Martin");
        assert_eq!(details.total(), Ok(Decimal::new(12993, 2)));

        assert_eq!(repo.find_details(OrderId(9_999)).await.expect("details"), None);

        pool.close().await;
    }

    #[tokio::test]
    async fn overflowing_order_total_rolls_back_before_commit() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());
        let books = SqlBookRepository::new(pool.clone());
        let isbn = Isbn(CLEAN_CODE.to_string());

        books
            .update_price(&isbn, Decimal::from_str("10000000000000000000000").expect("decimal"))
            .await
            .expect("update price");
        books.restock(&isbn, 1_000_000_000).await.expect("restock").expect("book exists");
        let stock_before = stock_of(&pool, CLEAN_CODE).await;
        let orders_before = order_count(&pool).await;

        let error = repo
            .create(CustomerId(1), &[line(CLEAN_CODE, 1_000_000_000)])
            .await
            .expect_err("total overflows");

        assert!(matches!(error, RepositoryError::Rejected(ToolError::InvalidInput(_))));
        assert_eq!(stock_of(&pool, CLEAN_CODE).await, stock_before);
        assert_eq!(order_count(&pool).await, orders_before);
        let items: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_items WHERE quantity = 1000000000")
                .fetch_one(&pool)
                .await
                .expect("count");
        assert_eq!(items, 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_stored_status_is_a_decode_error() {
        let pool = seeded_pool().await;
        let repo = SqlOrderRepository::new(pool.clone());

        sqlx::query("UPDATE orders SET status = 'shipped-ish' WHERE id = 1")
            .execute(&pool)
            .await
            .expect("corrupt status");

        let error = repo.find_details(OrderId(1)).await.expect_err("bad status");
        assert!(matches!(error, RepositoryError::Decode(ref message) if message.contains("shipped-ish")));

        pool.close().await;
    }
}
