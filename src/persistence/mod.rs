//! Persistence Layer
//!
//! SQLite-backed store for positions, trades, trigger mirrors, close
//! events, inconsistency records, agent decisions, and account history.
//! Schema is created with inline migrations on startup; all multi-table
//! writes run inside short BEGIN/COMMIT transactions.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),
}

/// Initialize the database connection pool and run migrations.
pub async fn init_database(database_url: &str, max_connections: u32) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let statements: &[(&str, &str)] = &[
        (
            "positions",
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                quantity REAL NOT NULL CHECK(quantity > 0),
                leverage REAL NOT NULL CHECK(leverage >= 1),
                entry_price REAL NOT NULL,
                opened_at DATETIME NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                partial_close_fraction REAL NOT NULL DEFAULT 0.0,
                warning_score REAL NOT NULL DEFAULT 0.0,
                reversal_warning INTEGER NOT NULL DEFAULT 0,
                peak_pnl_percent REAL NOT NULL DEFAULT 0.0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (symbol, side)
            )
            "#,
        ),
        (
            "trades",
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                type TEXT NOT NULL CHECK(type IN ('open', 'close')),
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                leverage REAL NOT NULL,
                pnl REAL,
                fee REAL NOT NULL DEFAULT 0.0,
                close_reason TEXT,
                timestamp DATETIME NOT NULL,
                status TEXT NOT NULL DEFAULT 'filled'
            )
            "#,
        ),
        (
            "price_orders",
            r#"
            CREATE TABLE IF NOT EXISTS price_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                type TEXT NOT NULL
                    CHECK(type IN ('stop_loss', 'take_profit', 'extreme_take_profit')),
                trigger_price REAL NOT NULL,
                order_price REAL,
                quantity REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK(status IN ('active', 'triggered', 'cancelled')),
                position_order_id TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        ),
        (
            "position_close_events",
            r#"
            CREATE TABLE IF NOT EXISTS position_close_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                entry_price REAL NOT NULL,
                close_price REAL NOT NULL,
                quantity REAL NOT NULL,
                leverage REAL NOT NULL,
                pnl REAL NOT NULL,
                pnl_percent REAL NOT NULL,
                fee REAL NOT NULL,
                close_reason TEXT NOT NULL,
                trigger_type TEXT,
                order_id TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                processed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        ),
        (
            "inconsistent_states",
            r#"
            CREATE TABLE IF NOT EXISTS inconsistent_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                exchange_order_id TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at DATETIME,
                resolved_by TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        ),
        (
            "agent_decisions",
            r#"
            CREATE TABLE IF NOT EXISTS agent_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                iteration INTEGER NOT NULL,
                decision TEXT NOT NULL,
                actions_taken TEXT NOT NULL,
                account_value REAL NOT NULL,
                positions_count INTEGER NOT NULL
            )
            "#,
        ),
        (
            "account_history",
            r#"
            CREATE TABLE IF NOT EXISTS account_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                total_value REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                return_percent REAL NOT NULL
            )
            "#,
        ),
    ];

    for (table, sql) in statements {
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_trades_symbol_side ON trades(symbol, side)",
        "CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_price_orders_status ON price_orders(status)",
        "CREATE INDEX IF NOT EXISTS idx_price_orders_symbol_side ON price_orders(symbol, side)",
        "CREATE INDEX IF NOT EXISTS idx_close_events_created ON position_close_events(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_inconsistent_resolved ON inconsistent_states(resolved)",
        "CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON agent_decisions(timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_history_timestamp ON account_history(timestamp)",
    ];
    for sql in indexes {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:", 5).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_all_tables() {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('positions', 'trades', 'price_orders', 'position_close_events', \
              'inconsistent_states', 'agent_decisions', 'account_history')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 7);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
