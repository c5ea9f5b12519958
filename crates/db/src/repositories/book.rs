use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use bookdesk_core::domain::book::{Book, Isbn, SearchField};
use bookdesk_core::errors::ToolError;

use super::{parse_decimal, BookRepository, PriceChange, RepositoryError, StockChange};
use crate::DbPool;

pub struct SqlBookRepository {
    pool: DbPool,
}

impl SqlBookRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BookRepository for SqlBookRepository {
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError> {
        let row = sqlx::query("SELECT isbn, title, author, price, stock FROM books WHERE isbn = ?")
            .bind(isbn.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(book_from_row).transpose()
    }

    async fn search(&self, query: &str, field: SearchField) -> Result<Vec<Book>, RepositoryError> {
        // instr() keeps `%` and `_` in user input literal.
        let sql = match field {
            SearchField::Title => {
                "SELECT isbn, title, author, price, stock
                 FROM books
                 WHERE instr(lower(title), lower(?)) > 0
                 ORDER BY title ASC"
            }
            SearchField::Author => {
                "SELECT isbn, title, author, price, stock
                 FROM books
                 WHERE instr(lower(author), lower(?)) > 0
                 ORDER BY author ASC, title ASC"
            }
        };

        let rows = sqlx::query(sql).bind(query.trim()).fetch_all(&self.pool).await?;
        rows.into_iter().map(book_from_row).collect()
    }

    async fn restock(
        &self,
        isbn: &Isbn,
        quantity: i64,
    ) -> Result<Option<StockChange>, RepositoryError> {
        if quantity <= 0 {
            return Err(ToolError::InvalidInput("Quantity must be positive".to_string()).into());
        }

        // SQLite turns an overflowing integer sum into a REAL, so the ceiling is
        // enforced in the WHERE clause before anything is written.
        let new_stock: Option<i64> = sqlx::query_scalar(
            "UPDATE books SET stock = stock + ?1
             WHERE isbn = ?2 AND stock <= ?3
             RETURNING stock",
        )
        .bind(quantity)
        .bind(isbn.as_str())
        .bind(i64::MAX - quantity)
        .fetch_optional(&self.pool)
        .await?;

        match new_stock {
            Some(new_stock) => Ok(Some(StockChange { old_stock: new_stock - quantity, new_stock })),
            None => match self.find_by_isbn(isbn).await? {
                Some(book) => Err(ToolError::InvalidInput(format!(
                    "Restocking '{}' by {quantity} would exceed the maximum stock level (current: {})",
                    book.title, book.stock
                ))
                .into()),
                None => Ok(None),
            },
        }
    }

    async fn update_price(
        &self,
        isbn: &Isbn,
        price: Decimal,
    ) -> Result<Option<PriceChange>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT price FROM books WHERE isbn = ?")
            .bind(isbn.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            return Ok(None);
        };
        let old_price = parse_decimal("price", &current)?;

        sqlx::query("UPDATE books SET price = ? WHERE isbn = ?")
            .bind(price.to_string())
            .bind(isbn.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(PriceChange { old_price, new_price: price }))
    }

    async fn below_stock(&self, threshold: i64) -> Result<Vec<Book>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT isbn, title, author, price, stock
             FROM books
             WHERE stock < ?
             ORDER BY stock ASC, title ASC",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(book_from_row).collect()
    }
}

pub(crate) fn book_from_row(row: SqliteRow) -> Result<Book, RepositoryError> {
    let price_raw = row.try_get::<String, _>("price")?;

    Ok(Book {
        isbn: Isbn(row.try_get("isbn")?),
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        price: parse_decimal("price", &price_raw)?,
        stock: row.try_get("stock")?,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use bookdesk_core::domain::book::{Isbn, SearchField, LOW_STOCK_THRESHOLD};
    use bookdesk_core::errors::ToolError;

    use super::SqlBookRepository;
    use crate::repositories::test_support::seeded_pool;
    use crate::repositories::{BookRepository, PriceChange, RepositoryError, StockChange};

    #[tokio::test]
    async fn title_search_is_case_insensitive_substring_match() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());

        let found = repo.search("clean", SearchField::Title).await.expect("search");
        let titles: Vec<&str> = found.iter().map(|book| book.title.as_str()).collect();
        assert_eq!(titles, vec!["Clean Code", "The Clean Coder"]);

        let none = repo.search("cooking", SearchField::Title).await.expect("search");
        assert!(none.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn author_search_orders_by_author_then_title() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());

        let found = repo.search("MARTIN", SearchField::Author).await.expect("search");
        let pairs: Vec<(&str, &str)> =
            found.iter().map(|book| (book.author.as_str(), book.title.as_str())).collect();
        assert_eq!(
            pairs,
            vec![
                ("Martin Kleppmann", "Designing Data-Intensive Applications"),
                ("Robert C. Martin", "Clean Code"),
                ("Robert C. Martin", "The Clean Coder"),
            ]
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn search_treats_like_wildcards_literally() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());

        let found = repo.search("%", SearchField::Title).await.expect("search");
        assert!(found.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn restock_reports_old_and_new_stock() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());
        let isbn = Isbn("978-0132350884".to_string());

        let change = repo.restock(&isbn, 5).await.expect("restock");
        assert_eq!(change, Some(StockChange { old_stock: 25, new_stock: 30 }));

        let missing = repo.restock(&Isbn("000".to_string()), 5).await.expect("restock missing");
        assert_eq!(missing, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn restock_past_the_integer_ceiling_is_rejected_without_writing() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());
        let isbn = Isbn("978-0132350884".to_string());

        let error = repo.restock(&isbn, i64::MAX).await.expect_err("would overflow");
        assert!(matches!(error, RepositoryError::Rejected(ToolError::InvalidInput(_))));

        let stored: (String, i64) =
            sqlx::query_as("SELECT typeof(stock), stock FROM books WHERE isbn = ?")
                .bind(isbn.as_str())
                .fetch_one(&pool)
                .await
                .expect("stock column");
        assert_eq!(stored, ("integer".to_string(), 25));

        let found = repo.search("clean", SearchField::Title).await.expect("search still decodes");
        assert_eq!(found.len(), 2);

        let ceiling = repo.restock(&isbn, i64::MAX - 25).await.expect("exactly at ceiling");
        assert_eq!(ceiling, Some(StockChange { old_stock: 25, new_stock: i64::MAX }));

        pool.close().await;
    }

    #[tokio::test]
    async fn stock_column_rejects_non_integer_values() {
        let pool = seeded_pool().await;

        let result = sqlx::query("UPDATE books SET stock = 1.5 WHERE isbn = '978-0132350884'")
            .execute(&pool)
            .await;
        assert!(result.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn update_price_returns_previous_price() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());
        let isbn = Isbn("978-0132350884".to_string());

        let change = repo.update_price(&isbn, Decimal::new(4250, 2)).await.expect("update");
        assert_eq!(
            change,
            Some(PriceChange { old_price: Decimal::new(3999, 2), new_price: Decimal::new(4250, 2) })
        );

        let book = repo.find_by_isbn(&isbn).await.expect("find").expect("book exists");
        assert_eq!(book.price, Decimal::new(4250, 2));

        pool.close().await;
    }

    #[tokio::test]
    async fn below_stock_lists_scarcest_first() {
        let pool = seeded_pool().await;
        let repo = SqlBookRepository::new(pool.clone());

        let low = repo.below_stock(LOW_STOCK_THRESHOLD).await.expect("low stock");
        let stocks: Vec<i64> = low.iter().map(|book| book.stock).collect();
        assert_eq!(stocks, vec![3, 5, 7, 8]);
        assert!(low.iter().all(|book| book.is_low_stock()));

        pool.close().await;
    }
}
