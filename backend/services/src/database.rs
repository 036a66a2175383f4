use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;

pub async fn create_connection(database_url: &str) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(database_url.to_owned());
    options
        .max_connections(16)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .with_context(|| format!("Failed to connect to database: {}", database_url))?;

    Ok(db)
}

/// Timestamps are stored as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// Note: schema migrations run separately through the migration CLI:
// cd migrations && cargo run -- up

#[cfg(test)]
pub(crate) async fn test_connection() -> DatabaseConnection {
    use migration::{Migrator, MigratorTrait};

    let db = Database::connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    Migrator::up(&db, None).await.expect("run migrations");
    db
}
