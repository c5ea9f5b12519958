use std::sync::Arc;

use crate::repositories::{
    BookRepository, OrderRepository, SessionRepository, SqlBookRepository, SqlOrderRepository,
    SqlSessionRepository,
};
use crate::DbPool;

/// Handle to every repository backing the desk. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct LibraryStore {
    pool: DbPool,
    books: Arc<dyn BookRepository>,
    orders: Arc<dyn OrderRepository>,
    sessions: Arc<dyn SessionRepository>,
}

impl LibraryStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            books: Arc::new(SqlBookRepository::new(pool.clone())),
            orders: Arc::new(SqlOrderRepository::new(pool.clone())),
            sessions: Arc::new(SqlSessionRepository::new(pool.clone())),
            pool,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn books(&self) -> &dyn BookRepository {
        self.books.as_ref()
    }

    pub fn orders(&self) -> &dyn OrderRepository {
        self.orders.as_ref()
    }

    pub fn sessions(&self) -> &dyn SessionRepository {
        self.sessions.as_ref()
    }
}

impl std::fmt::Debug for LibraryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryStore").finish_non_exhaustive()
    }
}
