// Trial execution targets used by the SQL refiner
pub mod druid;
pub mod mysql;
pub mod postgresql;

pub use druid::DruidExecutor;
pub use mysql::MySqlExecutor;
pub use postgresql::PostgresExecutor;

use crate::error::AppError;
use crate::services::ConnectionPoolManager;
use std::sync::Arc;

/// Database type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    MySQL,
    Doris,
    Druid,
}

impl DatabaseType {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(DatabaseType::PostgreSQL),
            "mysql" => Ok(DatabaseType::MySQL),
            "doris" => Ok(DatabaseType::Doris),
            "druid" => Ok(DatabaseType::Druid),
            other => Err(AppError::UnsupportedDialect(other.to_string())),
        }
    }

    /// Dialect name understood by `dialect_for`
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::MySQL => "mysql",
            DatabaseType::Doris => "doris",
            DatabaseType::Druid => "druid",
        }
    }
}

/// Live connection used for the syntax check and the row-capped trial run.
/// Implementations never return more than a handful of rows and never
/// execute anything but the statement they are handed.
#[async_trait::async_trait]
pub trait TrialExecutor: Send + Sync {
    /// Dialect name of the target
    fn dialect(&self) -> &str;

    /// Plan-only check (`EXPLAIN`); no rows are materialized.
    async fn explain(&self, sql: &str) -> Result<(), AppError>;

    /// Run `sql` wrapped in a row cap and report how many rows came back.
    async fn execute_bounded(&self, sql: &str, row_cap: u64) -> Result<usize, AppError>;

    async fn test_connection(&self) -> Result<(), AppError>;
}

/// Build the executor for a dialect. PostgreSQL and MySQL-protocol targets
/// share pools through `pool_manager`.
pub async fn create_executor(
    db_type: DatabaseType,
    connection_url: &str,
    pool_manager: Arc<ConnectionPoolManager>,
) -> Result<Arc<dyn TrialExecutor>, AppError> {
    match db_type {
        DatabaseType::PostgreSQL => {
            let pool = pool_manager.postgres_pool(connection_url).await?;
            Ok(Arc::new(PostgresExecutor::new(pool, connection_url)?))
        }
        DatabaseType::MySQL => {
            let url = mysql::mysql_url(connection_url, &["mysql", "mariadb"])?;
            let pool = pool_manager.mysql_pool(&url).await?;
            Ok(Arc::new(MySqlExecutor::new(pool, DatabaseType::MySQL)?))
        }
        DatabaseType::Doris => {
            let url = mysql::mysql_url(connection_url, &["doris", "mysql"])?;
            let pool = pool_manager.mysql_pool(&url).await?;
            Ok(Arc::new(MySqlExecutor::new(pool, DatabaseType::Doris)?))
        }
        DatabaseType::Druid => Ok(Arc::new(DruidExecutor::new(connection_url)?)),
    }
}
