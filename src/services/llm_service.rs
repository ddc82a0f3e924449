use crate::config::LlmConfig;
use crate::error::AppError;
use crate::models::{IssueKind, SchemaMetadata};
use crate::validation::{CorrectionRequest, Corrector};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

/// SQL corrector backed by a text-generation gateway.
///
/// The gateway receives `{prompt, max_tokens, temperature}` and answers with
/// the statement under `text`, `content` or `response`.
pub struct LlmCorrector {
    gateway_url: String,
    api_key: Option<String>,
    http_client: HttpClient,
    max_tokens: u32,
    temperature: f32,
    schema_context: Option<String>,
}

impl LlmCorrector {
    pub fn new(config: &LlmConfig) -> Result<Self, AppError> {
        let gateway_url = config
            .gateway_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AppError::Config("llm.gateway_url is not set".to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            gateway_url,
            api_key: config.api_key.clone(),
            http_client,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            schema_context: None,
        })
    }

    /// Include the table layout in every prompt.
    pub fn with_schema(mut self, schema: &SchemaMetadata) -> Self {
        self.schema_context = Some(prepare_schema_context(schema));
        self
    }

    fn build_prompt(&self, request: &CorrectionRequest<'_>) -> String {
        let dialect_hints = match request.dialect {
            "mysql" | "doris" => {
                "- Use MySQL syntax and functions\n- Use backticks for identifier quoting if needed: `table_name`\n- Booleans are 1/0"
            }
            "druid" => {
                "- Use Druid SQL syntax\n- Use TIME_EXTRACT(expr, 'UNIT') for date parts\n- Use double quotes for identifier quoting if needed"
            }
            _ => {
                "- Use PostgreSQL syntax and functions\n- Use EXTRACT(UNIT FROM expr) for date parts\n- Use double quotes for identifier quoting if needed: \"table_name\""
            }
        };

        let issues: String = request
            .issues
            .iter()
            .map(|issue| format!("- [{}] {}\n", issue_label(issue.kind), issue.message))
            .collect();

        let mut previous = String::new();
        for iteration in request.history {
            previous.push_str(&format!("Attempt {}: {}\n", iteration.attempt, iteration.sql));
            for issue in &iteration.issues {
                let label = issue_label(issue.kind);
                previous.push_str(&format!("  - [{}] {}\n", label, issue.message));
            }
        }
        if previous.is_empty() {
            previous.push_str("(none)\n");
        }

        let schema = self.schema_context.as_deref().unwrap_or("(not provided)\n");

        format!(
            r#"You are a SQL expert. The following {dialect} query failed validation. Propose ONE corrected SELECT query.

Database Schema:
{schema}
Failing query:
{sql}

Issues:
{issues}
Previous attempts (do not repeat any of them):
{previous}
Instructions:
1. Return ONLY the corrected {dialect} SELECT query, nothing else
2. Do not include any explanations or markdown formatting
3. Use only table and column names from the schema above
{dialect_hints}

SQL Query:"#,
            dialect = request.dialect,
            schema = schema,
            sql = request.sql,
            issues = issues,
            previous = previous,
            dialect_hints = dialect_hints,
        )
    }

    async fn call_llm_api(&self, prompt: &str) -> Result<String, AppError> {
        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "prompt": prompt,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::LlmService(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to parse LLM response: {}", e)))?;

        extract_sql(&result)
    }
}

#[async_trait::async_trait]
impl Corrector for LlmCorrector {
    async fn propose(&self, request: CorrectionRequest<'_>) -> Result<String, AppError> {
        let prompt = self.build_prompt(&request);
        tracing::debug!(
            "Requesting SQL correction ({} issue(s), {} earlier attempt(s))",
            request.issues.len(),
            request.history.len()
        );
        self.call_llm_api(&prompt).await
    }
}

fn issue_label(kind: IssueKind) -> &'static str {
    match kind {
        IssueKind::NotReadOnly => "not read-only",
        IssueKind::Syntax => "syntax",
        IssueKind::Runtime => "runtime",
        IssueKind::Timeout => "timeout",
        IssueKind::Correction => "correction",
    }
}

/// Pull the statement out of a gateway reply and strip markdown fences.
fn extract_sql(result: &Value) -> Result<String, AppError> {
    let sql = result["text"]
        .as_str()
        .or_else(|| result["content"].as_str())
        .or_else(|| result["response"].as_str())
        .ok_or_else(|| {
            AppError::LlmService("LLM response does not contain SQL query".to_string())
        })?;

    let cleaned_sql = sql
        .trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string();

    if cleaned_sql.is_empty() {
        return Err(AppError::LlmService("LLM returned an empty statement".to_string()));
    }
    Ok(cleaned_sql)
}

fn prepare_schema_context(schema: &SchemaMetadata) -> String {
    let mut context = String::from("Tables:\n");
    for table in &schema.tables {
        context.push_str(&format!("  - {}", table.name));
        if table.deprecated {
            context.push_str(" [DEPRECATED]");
        }
        context.push('\n');
        for column in &table.columns {
            context.push_str(&format!("      * {} ({})", column.name, column.data_type));
            if column.is_primary_key {
                context.push_str(" [PRIMARY KEY]");
            }
            if column.is_foreign_key {
                context.push_str(" [FOREIGN KEY]");
            }
            context.push('\n');
        }
    }

    if !schema.relationships.is_empty() {
        context.push_str("Relationships:\n");
        for rel in &schema.relationships {
            context.push_str(&format!(
                "  - {}.{} = {}.{}\n",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            ));
        }
    }
    context
}
