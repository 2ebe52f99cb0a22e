// Not every test binary uses every helper.
#![allow(dead_code)]

// Shared test harness: an in-memory SQLite implementation of the MCP
// tool bus, speaking the same tool names and payload shapes as the real
// store host. Lets the repository and agent run end-to-end with no child
// process and no network.

use async_trait::async_trait;
use parking_lot::Mutex;
use prp_agent::error::{AgentError, AgentResult};
use prp_agent::mcp::client::ToolBus;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The schema the agent expects to already exist in the remote store.
const SCHEMA: &str = "
    CREATE TABLE knowledge_base (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        content TEXT NOT NULL,
        category TEXT NOT NULL,
        expertise_level TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL UNIQUE,
        file_hash TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        user_message TEXT NOT NULL,
        agent_response TEXT NOT NULL,
        file_context TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(session_id, seq)
    );

    CREATE TABLE prps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        objective TEXT NOT NULL,
        context_data TEXT,
        implementation_details TEXT,
        validation_gates TEXT,
        status TEXT NOT NULL DEFAULT 'draft',
        priority TEXT NOT NULL DEFAULT 'medium',
        tags TEXT NOT NULL DEFAULT '',
        search_text TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

pub struct FakeStoreBus {
    conn: Mutex<Connection>,
    calls: AtomicUsize,
    /// When set, every call fails with a transport error (simulates a
    /// dead MCP child).
    broken: AtomicBool,
    /// When set, only mutating calls fail (reads still work) — for
    /// exercising the persist-after-generation failure path.
    write_broken: AtomicBool,
}

impl FakeStoreBus {
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory sqlite");
        conn.execute_batch(SCHEMA).expect("apply schema");
        FakeStoreBus {
            conn: Mutex::new(conn),
            calls: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
            write_broken: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_write_broken(&self, broken: bool) {
        self.write_broken.store(broken, Ordering::SeqCst);
    }

    fn read(&self, sql: &str, params: &[Value]) -> AgentResult<Value> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AgentError::store(e.to_string()))?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|c| c.to_string()).collect();

        let sql_params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(sql_params))
            .map_err(|e| AgentError::store(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| AgentError::store(e.to_string()))? {
            let mut obj = Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value: SqlValue = row
                    .get(i)
                    .map_err(|e| AgentError::store(e.to_string()))?;
                obj.insert(name.clone(), sql_to_json(value));
            }
            out.push(Value::Object(obj));
        }
        Ok(json!({ "rows": out }))
    }

    fn write(&self, sql: &str, params: &[Value]) -> AgentResult<Value> {
        let conn = self.conn.lock();
        let sql_params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
        let affected = conn
            .execute(sql, rusqlite::params_from_iter(sql_params))
            .map_err(|e| AgentError::store(e.to_string()))?;
        Ok(json!({
            "rowsAffected": affected as u64,
            "lastInsertRowid": conn.last_insert_rowid(),
        }))
    }
}

#[async_trait]
impl ToolBus for FakeStoreBus {
    async fn call_tool(&self, name: &str, arguments: Value) -> AgentResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(AgentError::transport("child process is gone"));
        }

        let sql = arguments["sql"].as_str().unwrap_or_default().to_string();
        let params: Vec<Value> = arguments["params"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        match name {
            "list_databases" => Ok(json!({ "databases": ["kb"] })),
            "list_tables" => Ok(json!({ "tables": ["knowledge_base", "conversations", "prps"] })),
            "describe_table" => {
                let table = arguments["name"].as_str().unwrap_or_default().to_string();
                let rows = self.read(&format!("PRAGMA table_info({table})"), &[])?;
                let columns: Vec<Value> = rows["rows"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| json!({ "name": r["name"], "type": r["type"] }))
                    .collect();
                Ok(json!({ "columns": columns }))
            }
            "execute_read_only_query" => self.read(&sql, &params),
            "execute_query" => {
                if self.write_broken.load(Ordering::SeqCst) {
                    return Err(AgentError::transport("child died mid-write"));
                }
                self.write(&sql, &params)
            }
            "execute_batch" => {
                let statements = arguments["statements"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let mut results = Vec::new();
                for st in statements {
                    let st_sql = st["sql"].as_str().unwrap_or_default().to_string();
                    let st_params: Vec<Value> =
                        st["params"].as_array().cloned().unwrap_or_default();
                    results.push(self.write(&st_sql, &st_params)?);
                }
                Ok(json!({ "results": results }))
            }
            other => Err(AgentError::store(format!("unknown tool '{other}'"))),
        }
    }
}

fn json_to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(v: SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => json!(i),
        SqlValue::Real(f) => json!(f),
        SqlValue::Text(s) => json!(s),
        SqlValue::Blob(b) => json!(String::from_utf8_lossy(&b)),
    }
}
