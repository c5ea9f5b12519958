use sqlx::{sqlite::SqliteRow, Row};

use bookdesk_core::domain::customer::{Customer, CustomerId};

use super::{CustomerRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCustomerRepository {
    pool: DbPool,
}

impl SqlCustomerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CustomerRepository for SqlCustomerRepository {
    async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, email FROM customers WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(customer_from_row).transpose()
    }
}

fn customer_from_row(row: SqliteRow) -> Result<Customer, RepositoryError> {
    Ok(Customer {
        id: CustomerId(row.try_get("id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
    })
}

#[cfg(test)]
mod tests {
    use bookdesk_core::domain::customer::CustomerId;

    use super::SqlCustomerRepository;
    use crate::repositories::test_support::seeded_pool;
    use crate::repositories::CustomerRepository;

    #[tokio::test]
    async fn finds_seeded_customer_and_misses_unknown_id() {
        let pool = seeded_pool().await;
        let repo = SqlCustomerRepository::new(pool.clone());

        let ada = repo.find_by_id(CustomerId(1)).await.expect("find").expect("customer exists");
        assert_eq!(ada.name, "Ada Lovelace");
        assert_eq!(ada.email, "ada@example.com");

        assert_eq!(repo.find_by_id(CustomerId(999)).await.expect("find"), None);

        pool.close().await;
    }
}
