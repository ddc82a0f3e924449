// Apache Druid trial executor over the SQL HTTP API
use crate::error::AppError;
use crate::services::database::TrialExecutor;
use crate::services::dialect::Druid;
use crate::validation::SqlValidator;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

pub struct DruidExecutor {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct DruidSqlRequest {
    query: String,
    #[serde(rename = "resultFormat")]
    result_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Value>,
}

/// `druid://host:port` maps to `http://host:port`; http(s) URLs keep their
/// scheme and lose any path.
pub fn druid_base_url(connection_url: &str) -> Result<String, AppError> {
    let url = Url::parse(connection_url)
        .map_err(|e| AppError::Connection(format!("Invalid Druid URL: {}", e)))?;
    let host = url.host_str().unwrap_or("localhost");

    match url.scheme() {
        "druid" => Ok(format!("http://{}:{}", host, url.port().unwrap_or(8888))),
        "http" | "https" => Ok(format!(
            "{}://{}{}",
            url.scheme(),
            host,
            url.port().map(|p| format!(":{}", p)).unwrap_or_default()
        )),
        _ => Err(AppError::Connection(
            "URL must use druid://, http://, or https:// scheme for Druid".to_string(),
        )),
    }
}

impl DruidExecutor {
    pub fn new(connection_url: &str) -> Result<Self, AppError> {
        let base_url = druid_base_url(connection_url)?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// POST a statement to `/druid/v2/sql`; rows come back as arrays.
    async fn execute_sql(&self, sql: String) -> Result<Vec<Value>, AppError> {
        let sql_endpoint = format!("{}/druid/v2/sql", self.base_url);
        let request = DruidSqlRequest {
            query: sql,
            result_format: "array",
            context: Some(json!({
                "sqlTimeZone": "UTC",
                "useCache": false,
            })),
        };

        let response = self
            .client
            .post(&sql_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Database(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Database(format!(
                "Druid SQL query failed ({}): {}",
                status, error_body
            )));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| AppError::Database(format!("Failed to parse Druid response: {}", e)))
    }
}

#[async_trait::async_trait]
impl TrialExecutor for DruidExecutor {
    fn dialect(&self) -> &str {
        "druid"
    }

    async fn explain(&self, sql: &str) -> Result<(), AppError> {
        self.execute_sql(SqlValidator::explain_statement(sql, &Druid)).await?;
        Ok(())
    }

    async fn execute_bounded(&self, sql: &str, row_cap: u64) -> Result<usize, AppError> {
        let rows = self.execute_sql(SqlValidator::trial_statement(sql, row_cap)).await?;
        Ok(rows.len())
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        let status_endpoint = format!("{}/status", self.base_url);
        let response = self
            .client
            .get(&status_endpoint)
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Connection(format!(
                "Connection test failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
