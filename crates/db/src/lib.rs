use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod events;
pub mod models;
pub mod types;

// Re-exported so downstream crates spell errors and transactions the same way.
pub use sea_orm::DbErr;
pub use sea_orm::TransactionTrait;

pub type DbPool = DatabaseConnection;

#[derive(Clone)]
pub struct DBService {
    pub pool: DatabaseConnection,
}

impl DBService {
    /// Connects to the agent database and brings the support schema up to
    /// date. The queue tables live in the same database as the replicated
    /// tables so capture triggers and the apply path share transactions.
    pub async fn new(dsn: &str) -> Result<DBService, DbErr> {
        let mut options = ConnectOptions::new(dsn.to_string());
        // A pooled in-memory database must stay on one connection or every
        // checkout would see a different empty database.
        let max_connections = if dsn.contains(":memory:") { 1 } else { 5 };
        options
            .max_connections(max_connections)
            .connect_timeout(Duration::from_secs(30))
            .sqlx_logging(false);

        let pool = Database::connect(options).await?;
        if pool.get_database_backend() == sea_orm::DbBackend::Sqlite {
            pool.execute_unprepared("PRAGMA journal_mode = WAL;").await?;
            pool.execute_unprepared("PRAGMA synchronous = NORMAL;").await?;
            pool.execute_unprepared("PRAGMA busy_timeout = 30000;").await?;
        }
        db_migration::Migrator::up(&pool, None).await?;
        Ok(DBService { pool })
    }

    /// In-memory database for tests and ad-hoc tooling.
    pub async fn new_in_memory() -> Result<DBService, DbErr> {
        Self::new("sqlite::memory:").await
    }
}
