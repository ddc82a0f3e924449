// MySQL-protocol trial executor. Apache Doris speaks the same wire protocol,
// so one executor serves both; only the dialect differs.
use crate::error::AppError;
use crate::services::database::{DatabaseType, TrialExecutor};
use crate::services::dialect::{dialect_for, SqlDialect};
use crate::validation::SqlValidator;
use mysql_async::{prelude::*, Conn, Pool, Row};
use url::Url;

pub struct MySqlExecutor {
    pool: Pool,
    db_type: DatabaseType,
    dialect: Box<dyn SqlDialect>,
}

/// Validate the URL scheme and rewrite it to `mysql://` for the driver.
pub fn mysql_url(connection_url: &str, accepted_schemes: &[&str]) -> Result<String, AppError> {
    let mut url = Url::parse(connection_url)
        .map_err(|e| AppError::Connection(format!("Invalid URL: {}", e)))?;

    if !accepted_schemes.contains(&url.scheme()) {
        return Err(AppError::Connection(format!(
            "URL must use one of {} schemes",
            accepted_schemes
                .iter()
                .map(|s| format!("{}://", s))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let scheme = url.scheme().to_string();
    if scheme != "mysql" {
        url.set_scheme("mysql").map_err(|_| {
            AppError::Connection(format!("Cannot rewrite {}:// to mysql://", scheme))
        })?;
    }
    Ok(url.to_string())
}

impl MySqlExecutor {
    pub fn new(pool: Pool, db_type: DatabaseType) -> Result<Self, AppError> {
        let dialect = dialect_for(db_type.as_str())?;
        Ok(Self { pool, db_type, dialect })
    }

    async fn get_conn(&self) -> Result<Conn, AppError> {
        self.pool.get_conn().await.map_err(|e| {
            AppError::Connection(format!(
                "Failed to get {} connection from pool: {}",
                self.db_type.as_str(),
                e
            ))
        })
    }
}

#[async_trait::async_trait]
impl TrialExecutor for MySqlExecutor {
    fn dialect(&self) -> &str {
        self.db_type.as_str()
    }

    async fn explain(&self, sql: &str) -> Result<(), AppError> {
        let mut conn = self.get_conn().await?;
        conn.query_drop(SqlValidator::explain_statement(sql, self.dialect.as_ref()))
            .await
            .map_err(|e| AppError::Database(format!("Query execution failed: {}", e)))
    }

    async fn execute_bounded(&self, sql: &str, row_cap: u64) -> Result<usize, AppError> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<Row> = conn
            .query(SqlValidator::trial_statement(sql, row_cap))
            .await
            .map_err(|e| AppError::Database(format!("Query execution failed: {}", e)))?;
        Ok(rows.len())
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        let mut conn = self.get_conn().await?;
        conn.ping()
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", e)))
    }
}
