// PRP Agent — Store Client
//
// Thin typed wrapper over the MCP tool bus. Every operation is exactly
// one request/response on the channel, with the target database and
// bound parameters carried in the tool arguments — SQL text never has
// values interpolated into it.
//
// The read path is guarded: a statement must look read-only (allowed
// prefix) and must not contain a write verb anywhere. The guard runs
// before any network call, so a rejected statement costs nothing. It is
// defense-in-depth only — parameter binding is the primary safety
// mechanism.

use crate::error::{AgentError, AgentResult};
use crate::mcp::client::ToolBus;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};

// ── Read-only guard ────────────────────────────────────────────────────

static READ_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(select|with|explain|pragma)\b").expect("valid read-prefix regex")
});

static WRITE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|replace)\b")
        .expect("valid write-verb regex")
});

/// Reject statements that are not read-only. Whole-word, case-insensitive;
/// a SELECT quoting a write verb in a string literal is also rejected.
fn check_read_only(sql: &str) -> AgentResult<()> {
    if !READ_PREFIX.is_match(sql) {
        return Err(AgentError::ReadOnlyViolation(format!(
            "statement does not start with a read-only keyword: {}",
            crate::types::truncate_utf8(sql, 80)
        )));
    }
    if let Some(m) = WRITE_VERB.find(sql) {
        return Err(AgentError::ReadOnlyViolation(format!(
            "statement contains write verb '{}'",
            m.as_str()
        )));
    }
    Ok(())
}

// ── Result types ───────────────────────────────────────────────────────

/// Rows come back as JSON objects keyed by column name.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Deserialize)]
struct ReadResult {
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default)]
    pub last_insert_rowid: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchResult {
    #[serde(default)]
    results: Vec<WriteResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct NameList {
    #[serde(default, alias = "databases", alias = "tables")]
    names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TableInfo {
    #[serde(default)]
    columns: Vec<ColumnInfo>,
}

/// One statement of an all-or-nothing batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            params,
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────────

pub struct StoreClient {
    bus: Arc<dyn ToolBus>,
    database: String,
}

impl StoreClient {
    pub fn new(bus: Arc<dyn ToolBus>, database: impl Into<String>) -> Self {
        StoreClient {
            bus,
            database: database.into(),
        }
    }

    /// The logical database every call targets.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// A clone of this client aimed at a different logical database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        StoreClient {
            bus: Arc::clone(&self.bus),
            database: database.into(),
        }
    }

    /// List the logical databases the store exposes.
    pub async fn list_databases(&self) -> AgentResult<Vec<String>> {
        let payload = self.bus.call_tool("list_databases", json!({})).await?;
        Ok(decode::<NameList>(payload)?.names)
    }

    /// List tables in the target database.
    pub async fn list_tables(&self) -> AgentResult<Vec<String>> {
        let payload = self
            .bus
            .call_tool("list_tables", json!({ "database": self.database }))
            .await?;
        Ok(decode::<NameList>(payload)?.names)
    }

    /// Describe the columns of a table.
    pub async fn describe_table(&self, table: &str) -> AgentResult<Vec<ColumnInfo>> {
        let payload = self
            .bus
            .call_tool(
                "describe_table",
                json!({ "database": self.database, "name": table }),
            )
            .await?;
        Ok(decode::<TableInfo>(payload)?.columns)
    }

    /// Run a read-only statement and return its rows.
    pub async fn read(&self, sql: &str, params: Vec<Value>) -> AgentResult<Vec<Row>> {
        check_read_only(sql)?;
        debug!("[store] read: {}", crate::types::truncate_utf8(sql, 120));
        let payload = self
            .bus
            .call_tool(
                "execute_read_only_query",
                json!({ "database": self.database, "sql": sql, "params": params }),
            )
            .await?;
        Ok(decode::<ReadResult>(payload)?.rows)
    }

    /// Run a single mutating statement.
    pub async fn write(&self, sql: &str, params: Vec<Value>) -> AgentResult<WriteResult> {
        debug!("[store] write: {}", crate::types::truncate_utf8(sql, 120));
        let payload = self
            .bus
            .call_tool(
                "execute_query",
                json!({ "database": self.database, "sql": sql, "params": params }),
            )
            .await?;
        decode(payload)
    }

    /// Run several statements as one all-or-nothing batch.
    pub async fn batch(&self, statements: Vec<Statement>) -> AgentResult<Vec<WriteResult>> {
        debug!("[store] batch of {} statement(s)", statements.len());
        let payload = self
            .bus
            .call_tool(
                "execute_batch",
                json!({ "database": self.database, "statements": statements }),
            )
            .await?;
        Ok(decode::<BatchResult>(payload)?.results)
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> AgentResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| AgentError::store(format!("malformed store payload: {e}")))
}

// ── Row helpers ────────────────────────────────────────────────────────

/// Fetch a string column, tolerating null as empty.
pub fn row_str(row: &Row, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Fetch an integer column, defaulting to 0.
pub fn row_i64(row: &Row, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────────────
