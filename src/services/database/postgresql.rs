// PostgreSQL trial executor over a deadpool connection pool
use crate::error::AppError;
use crate::services::connection_pool::mask_credentials;
use crate::services::database::TrialExecutor;
use crate::services::dialect::Postgres;
use crate::validation::SqlValidator;
use deadpool_postgres::{Object, Pool};
use url::Url;

pub struct PostgresExecutor {
    pool: Pool,
    connection_url: String,
}

impl PostgresExecutor {
    pub fn new(pool: Pool, connection_url: &str) -> Result<Self, AppError> {
        let url = Url::parse(connection_url)
            .map_err(|e| AppError::Connection(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(AppError::Connection(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self {
            pool,
            connection_url: connection_url.to_string(),
        })
    }

    async fn client(&self) -> Result<Object, AppError> {
        self.pool.get().await.map_err(|e| {
            AppError::Connection(format!(
                "Failed to get connection from pool for {}: {}",
                mask_credentials(&self.connection_url),
                e
            ))
        })
    }
}

fn describe(e: tokio_postgres::Error) -> AppError {
    let details = match e.as_db_error() {
        Some(db_error) => format!(
            "Code: {}, Message: {}",
            db_error.code().code(),
            db_error.message()
        ),
        None => e.to_string(),
    };
    AppError::Database(format!("Query execution failed: {}", details))
}

#[async_trait::async_trait]
impl TrialExecutor for PostgresExecutor {
    fn dialect(&self) -> &str {
        "postgresql"
    }

    async fn explain(&self, sql: &str) -> Result<(), AppError> {
        let client = self.client().await?;
        client
            .query(&SqlValidator::explain_statement(sql, &Postgres), &[])
            .await
            .map_err(describe)?;
        Ok(())
    }

    async fn execute_bounded(&self, sql: &str, row_cap: u64) -> Result<usize, AppError> {
        let client = self.client().await?;
        let rows = client
            .query(&SqlValidator::trial_statement(sql, row_cap), &[])
            .await
            .map_err(describe)?;
        Ok(rows.len())
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(describe)?;
        Ok(())
    }
}
