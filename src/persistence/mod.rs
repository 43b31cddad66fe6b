//! 审计持久化钩子
//!
//! 运行结束后尽力调用 `store(kind, payload) -> id`；失败只记日志，不向上传播。
//! 提供内存实现与 SQLite 实现（rusqlite，同步）。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde_json::Value;

/// 审计存储 trait
pub trait AuditStore: Send + Sync {
    /// 写入一条记录，返回记录 ID
    fn store(&self, kind: &str, payload: &Value) -> anyhow::Result<String>;
}

/// 一条审计记录
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: i64,
}

fn new_id() -> String {
    format!("audit_{}", uuid::Uuid::new_v4())
}

/// 内存实现
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditStore for MemoryAuditStore {
    fn store(&self, kind: &str, payload: &Value) -> anyhow::Result<String> {
        let id = new_id();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AuditEntry {
                id: id.clone(),
                kind: kind.to_string(),
                payload: payload.clone(),
                created_at: chrono::Utc::now().timestamp_millis(),
            });
        Ok(id)
    }
}

/// SQLite 实现：表 audit_records(id, kind, payload, created_at)
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_records (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_records(kind);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 按类型读取最近的记录（新 → 旧）
    pub fn recent(&self, kind: &str, limit: usize) -> anyhow::Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, created_at FROM audit_records
             WHERE kind = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, kind, payload, created_at) = row?;
            entries.push(AuditEntry {
                id,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at,
            });
        }
        Ok(entries)
    }
}

impl AuditStore for SqliteAuditStore {
    fn store(&self, kind: &str, payload: &Value) -> anyhow::Result<String> {
        let id = new_id();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO audit_records (id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, kind, payload.to_string(), chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(id)
    }
}
