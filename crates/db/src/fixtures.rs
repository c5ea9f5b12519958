use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_BOOK_ISBNS: &[&str] = &[
    "978-0132350884",
    "978-0201633610",
    "978-0134685991",
    "978-0135957059",
    "978-0596517748",
    "978-1593278281",
    "978-0262033848",
    "978-0137081073",
    "978-0321125217",
    "978-1449373320",
];

const SEED_CUSTOMER_EMAILS: &[&str] = &[
    "ada@example.com",
    "alan@example.com",
    "grace@example.com",
    "edsger@example.com",
    "barbara@example.com",
    "donald@example.com",
];

const SEED_ORDER_IDS: &[i64] = &[1, 2, 3];

/// Demo catalog: books (some below the low-stock threshold), customers and a few
/// historical orders.
pub struct LibrarySeed;

impl LibrarySeed {
    pub const SQL: &str = include_str!("../../../config/fixtures/library_seed.sql");

    /// Applies the fixture. Rows that already exist are left untouched, so reseeding
    /// never resets stock or prices changed since.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            books: SEED_BOOK_ISBNS.len(),
            customers: SEED_CUSTOMER_EMAILS.len(),
            orders: SEED_ORDER_IDS.len(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for isbn in SEED_BOOK_ISBNS {
            let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE isbn = ?1)")
                .bind(isbn)
                .fetch_one(pool)
                .await?;
            checks.push((format!("book {isbn}"), exists == 1));
        }

        for email in SEED_CUSTOMER_EMAILS {
            let exists: i64 =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM customers WHERE email = ?1)")
                    .bind(email)
                    .fetch_one(pool)
                    .await?;
            checks.push((format!("customer {email}"), exists == 1));
        }

        for order_id in SEED_ORDER_IDS {
            let line_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM order_items WHERE order_id = ?1")
                    .bind(order_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((format!("order {order_id} items"), line_count > 0));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub books: usize,
    pub customers: usize,
    pub orders: usize,
}

#[derive(Clone, Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

impl VerificationResult {
    pub fn missing(&self) -> Vec<&str> {
        self.checks.iter().filter(|(_, ok)| !*ok).map(|(label, _)| label.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{LibrarySeed, SEED_BOOK_ISBNS};
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_mentions_every_seed_book() {
        for isbn in SEED_BOOK_ISBNS {
            assert!(LibrarySeed::SQL.contains(isbn), "fixture is missing {isbn}");
        }
        assert!(LibrarySeed::SQL.contains("INSERT OR IGNORE"));
    }

    #[tokio::test]
    async fn verify_fails_before_load_and_passes_after() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let before = LibrarySeed::verify(&pool).await.expect("verify before");
        assert!(!before.all_present);
        assert!(before.missing().contains(&"book 978-0132350884"));

        LibrarySeed::load(&pool).await.expect("load");
        let after = LibrarySeed::verify(&pool).await.expect("verify after");
        assert!(after.all_present, "missing: {:?}", after.missing());

        pool.close().await;
    }

    #[tokio::test]
    async fn reseeding_keeps_mutated_rows() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        LibrarySeed::load(&pool).await.expect("first load");

        sqlx::query("UPDATE books SET stock = 1 WHERE isbn = '978-0132350884'")
            .execute(&pool)
            .await
            .expect("mutate");
        LibrarySeed::load(&pool).await.expect("second load");

        let stock: i64 =
            sqlx::query_scalar("SELECT stock FROM books WHERE isbn = '978-0132350884'")
                .fetch_one(&pool)
                .await
                .expect("stock");
        assert_eq!(stock, 1);

        let books: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM books").fetch_one(&pool).await.expect("count");
        assert_eq!(books, SEED_BOOK_ISBNS.len() as i64);

        pool.close().await;
    }
}
