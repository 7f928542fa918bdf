pub mod models;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Database connection pool and management
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to Postgres and configure the pool.
    ///
    /// `max_connections` is deliberately small: the core issues short,
    /// bursty queries from the scanner/walker/deploy drivers rather than
    /// holding long-lived transactions.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database");

        let options = PgConnectOptions::from_str(database_url)
            .context("invalid DATABASE_URL")?
            .application_name("ddui")
            .disable_statement_logging();

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;
        debug!("connected to {}", version);

        Ok(Database { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;

        info!("database migrations completed");
        Ok(())
    }

    /// Close the database connection gracefully
    pub async fn close(self) {
        info!("closing database connection");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_database_url() -> Option<String> {
        std::env::var("DDUI_TEST_DATABASE_URL").ok()
    }

    #[tokio::test]
    async fn test_database_connects_and_migrates() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };
        let db = Database::new(&url, 2).await.unwrap();
        db.migrate().await.unwrap();

        let result: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(result, 1);

        db.close().await;
    }
}
