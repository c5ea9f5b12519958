pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use connection::{connect_with_config, connect_with_settings, ping, DbPool};
pub use fixtures::{LibrarySeed, SeedResult, VerificationResult};
pub use repositories::RepositoryError;
pub use store::LibraryStore;
