use crate::{error::ConnectorError, snowflake::jwt::KeyPairAuth};
use model::flow::Peer;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

fn default_schema() -> String {
    "PUBLIC".to_string()
}

fn default_query_timeout_secs() -> u64 {
    3600
}

/// Peer options a Snowflake peer carries.
#[derive(Debug, Clone, Deserialize)]
pub struct SnowflakeConfig {
    pub account_id: String,
    pub username: String,
    pub private_key: String,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub warehouse: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl SnowflakeConfig {
    pub fn from_peer(peer: &Peer) -> Result<Self, ConnectorError> {
        serde_json::from_value(peer.options.clone())
            .map_err(|e| ConnectorError::InvalidConfig(format!("snowflake peer options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    num_rows: i64,
    #[serde(default)]
    row_type: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
}

/// One executed statement's result set. Cells arrive as nullable strings;
/// typed accessors parse on demand.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    pub num_rows: i64,
    pub columns: Vec<ColumnInfo>,
    pub data: Vec<Vec<Option<String>>>,
}

impl StatementResult {
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.data.get(row)?.get(col)?.as_deref()
    }

    pub fn i64_cell(&self, row: usize, col: usize) -> Option<i64> {
        self.cell(row, col)?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Thin statement-execution client over the Snowflake SQL API.
pub struct SnowflakeClient {
    http: reqwest::Client,
    auth: KeyPairAuth,
    config: SnowflakeConfig,
    base_url: String,
}

impl SnowflakeClient {
    pub fn new(config: SnowflakeConfig) -> Result<Self, ConnectorError> {
        let auth = KeyPairAuth::new(&config.account_id, &config.username, &config.private_key)?;
        let base_url = format!(
            "https://{}.snowflakecomputing.com",
            config.account_id.to_ascii_lowercase()
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs + 60))
            .build()?;
        Ok(Self {
            http,
            auth,
            config,
            base_url,
        })
    }

    fn headers(&self) -> Result<HeaderMap, ConnectorError> {
        let token = self.auth.token()?;
        let mut headers = HeaderMap::with_capacity(5);
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ConnectorError::InvalidConfig(format!("authorization header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Snowflake-Authorization-Token-Type",
            HeaderValue::from_static("KEYPAIR_JWT"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("sluice/0.1.0"));
        Ok(headers)
    }

    /// Executes a single statement and returns its (possibly empty) result
    /// set.
    pub async fn execute(&self, sql: &str) -> Result<StatementResult, ConnectorError> {
        self.submit(sql, 1).await
    }

    /// Executes several statements as one transaction. The whole body either
    /// commits or rolls back on the server.
    pub async fn execute_transaction(&self, statements: &[String]) -> Result<(), ConnectorError> {
        if statements.is_empty() {
            return Ok(());
        }
        let mut body = String::from("BEGIN;\n");
        for stmt in statements {
            body.push_str(stmt.trim_end_matches(';'));
            body.push_str(";\n");
        }
        body.push_str("COMMIT;");
        // statement_count 0 lets the server accept any number of statements.
        self.submit(&body, 0).await?;
        Ok(())
    }

    async fn submit(
        &self,
        sql: &str,
        statement_count: usize,
    ) -> Result<StatementResult, ConnectorError> {
        let request_id = Uuid::new_v4();
        let url = format!(
            "{}/api/v2/statements?requestId={request_id}&nullable=true",
            self.base_url
        );
        let mut body = json!({
            "statement": sql,
            "timeout": self.config.query_timeout_secs,
            "database": self.config.database.to_ascii_uppercase(),
            "schema": self.config.schema.to_ascii_uppercase(),
            "warehouse": self.config.warehouse.to_ascii_uppercase(),
            "parameters": { "MULTI_STATEMENT_COUNT": statement_count.to_string() },
        });
        if let Some(role) = &self.config.role {
            body["role"] = json!(role.to_ascii_uppercase());
        }

        debug!(statement = %sql.lines().next().unwrap_or_default(), "submitting statement");
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let wire: WireResponse = response.json().await?;

        if status.as_u16() == 202 {
            let handle = wire.statement_handle.clone().ok_or_else(|| {
                ConnectorError::Statement {
                    code: "202".into(),
                    message: "asynchronous response without statement handle".into(),
                }
            })?;
            return self.poll(&handle).await;
        }
        self.unwrap_response(status.is_success(), wire)
    }

    /// Polls an in-flight statement until it completes or the configured
    /// timeout elapses.
    async fn poll(&self, handle: &str) -> Result<StatementResult, ConnectorError> {
        let url = format!("{}/api/v2/statements/{handle}", self.base_url);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.query_timeout_secs);
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let response = self.http.get(&url).headers(self.headers()?).send().await?;
            let status = response.status();
            let wire: WireResponse = response.json().await?;
            if status.as_u16() == 202 {
                if tokio::time::Instant::now() >= deadline {
                    warn!(handle, "statement still running at timeout");
                    return Err(ConnectorError::Statement {
                        code: "timeout".into(),
                        message: format!("statement {handle} did not finish in time"),
                    });
                }
                continue;
            }
            return self.unwrap_response(status.is_success(), wire);
        }
    }

    fn unwrap_response(
        &self,
        success: bool,
        wire: WireResponse,
    ) -> Result<StatementResult, ConnectorError> {
        if !success {
            return Err(ConnectorError::Statement {
                code: wire.code.unwrap_or_else(|| "unknown".into()),
                message: wire.message.unwrap_or_else(|| "statement failed".into()),
            });
        }
        let meta = wire.result_set_meta_data.unwrap_or_default();
        Ok(StatementResult {
            num_rows: meta.num_rows,
            columns: meta.row_type,
            data: wire.data.unwrap_or_default(),
        })
    }
}
