//! SQLite 台账
//!
//! 单连接 + Mutex；每次操作都在 spawn_blocking 中执行，避免阻塞 tokio 工作线程。
//! 任务与主提示整条以 JSON 存入 body 列，只把查询用到的字段拆成独立列。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::{
    check_task_update, check_transition, AckStatus, Experience, Ledger, LedgerError,
    MasterPrompt, Message, MessageQuery, Priority, PromptAcknowledgment, RecordKind, Status,
    Task,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    message_type TEXT NOT NULL,
    priority TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    correlation_id TEXT,
    expires_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS experiences (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    correlation_id TEXT,
    message_id TEXT NOT NULL,
    initial_state TEXT NOT NULL,
    action TEXT NOT NULL,
    result TEXT NOT NULL,
    next_state TEXT NOT NULL,
    reward REAL NOT NULL,
    priority REAL NOT NULL,
    metadata TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiences_agent ON experiences(agent_id);
CREATE INDEX IF NOT EXISTS idx_experiences_priority ON experiences(priority);
CREATE INDEX IF NOT EXISTS idx_experiences_timestamp ON experiences(timestamp);

CREATE TABLE IF NOT EXISTS master_prompts (
    id TEXT PRIMARY KEY,
    is_active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prompt_acknowledgments (
    prompt_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    acknowledged_at TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata TEXT,
    PRIMARY KEY (prompt_id, agent_id)
);
"#;

const MESSAGE_COLUMNS: &str = "id, created_at, updated_at, sender_id, recipient_id, message_type, \
     priority, payload, status, correlation_id, expires_at";

const EXPERIENCE_COLUMNS: &str = "id, agent_id, correlation_id, message_id, initial_state, action, \
     result, next_state, reward, priority, metadata, timestamp";

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Status::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown status: {s}").into()))
    }
}

impl ToSql for Priority {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Priority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Priority::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown priority: {s}").into()))
    }
}

/// 读取 JSON 文本列
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        sender_id: row.get(3)?,
        recipient_id: row.get(4)?,
        message_type: row.get(5)?,
        priority: row.get(6)?,
        payload: json_column(row, 7)?,
        status: row.get(8)?,
        correlation_id: row.get(9)?,
        expires_at: row.get(10)?,
    })
}

fn experience_from_row(row: &Row<'_>) -> rusqlite::Result<Experience> {
    Ok(Experience {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        correlation_id: row.get(2)?,
        message_id: row.get(3)?,
        initial_state: json_column(row, 4)?,
        action: row.get(5)?,
        result: json_column(row, 6)?,
        next_state: json_column(row, 7)?,
        reward: row.get(8)?,
        priority: row.get(9)?,
        metadata: optional_json_column(row, 10)?,
        timestamp: row.get(11)?,
    })
}

fn ack_from_row(row: &Row<'_>) -> rusqlite::Result<PromptAcknowledgment> {
    let status: String = row.get(3)?;
    Ok(PromptAcknowledgment {
        prompt_id: row.get(0)?,
        agent_id: row.get(1)?,
        acknowledged_at: row.get(2)?,
        status: AckStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown acknowledgment status: {status}").into(),
            )
        })?,
        metadata: optional_json_column(row, 4)?,
    })
}

fn body_from_row<T: DeserializeOwned>(row: &Row<'_>) -> rusqlite::Result<T> {
    json_column(row, 0)
}

#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Storage(format!("create {:?}: {e}", parent)))?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程上执行一次数据库操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| LedgerError::Storage("connection mutex poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| LedgerError::Join(e.to_string()))?
    }
}

/// 插入失败时把主键 / 唯一约束冲突映射为 Duplicate
fn on_insert_error(
    kind: RecordKind,
    id: &str,
) -> impl FnOnce(rusqlite::Error) -> LedgerError + '_ {
    move |e| match e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            LedgerError::Duplicate {
                kind,
                id: id.to_string(),
            }
        }
        other => other.into(),
    }
}

fn load_message(conn: &Connection, id: &str) -> Result<Option<Message>, LedgerError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], message_from_row).optional()?)
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, LedgerError> {
    Ok(conn
        .query_row("SELECT body FROM tasks WHERE id = ?1", params![id], body_from_row)
        .optional()?)
}

fn load_experiences(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Experience>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, experience_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert_message(&self, message: &Message) -> Result<(), LedgerError> {
        let message = message.clone();
        self.with_conn(move |conn| {
            let payload = serde_json::to_string(&message.payload)?;
            conn.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    message.id,
                    message.created_at,
                    message.updated_at,
                    message.sender_id,
                    message.recipient_id,
                    message.message_type,
                    message.priority,
                    payload,
                    message.status,
                    message.correlation_id,
                    message.expires_at,
                ],
            )
            .map_err(on_insert_error(RecordKind::Message, &message.id))?;
            Ok(())
        })
        .await
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: Status,
    ) -> Result<Message, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<Status> = tx
                .query_row(
                    "SELECT status FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current.ok_or_else(|| LedgerError::NotFound {
                kind: RecordKind::Message,
                id: id.clone(),
            })?;
            check_transition(&id, current, status)?;
            tx.execute(
                "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, Utc::now(), id],
            )?;
            let updated = load_message(&tx, &id)?.ok_or_else(|| LedgerError::NotFound {
                kind: RecordKind::Message,
                id: id.clone(),
            })?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_message(conn, &id)).await
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, LedgerError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(status) = query.status {
                clauses.push("status = ?");
                values.push(Box::new(status));
            }
            if let Some(sender) = &query.sender_id {
                clauses.push("sender_id = ?");
                values.push(Box::new(sender.clone()));
            }
            if let Some(recipient) = &query.recipient_id {
                clauses.push("recipient_id = ?");
                values.push(Box::new(recipient.clone()));
            }
            if let Some(correlation) = &query.correlation_id {
                clauses.push("correlation_id = ?");
                values.push(Box::new(correlation.clone()));
            }
            if let Some(since) = query.since {
                clauses.push("created_at >= ?");
                values.push(Box::new(since));
            }

            let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY created_at ASC, rowid ASC");
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let rows = stmt.query_map(refs.as_slice(), message_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), LedgerError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&task)?;
            conn.execute(
                "INSERT INTO tasks (id, status, priority, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task.id, task.status, task.priority, task.created_at, body],
            )
            .map_err(on_insert_error(RecordKind::Task, &task.id))?;
            Ok(())
        })
        .await
    }

    async fn update_task(&self, task: &Task) -> Result<(), LedgerError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored = load_task(&tx, &task.id)?.ok_or_else(|| LedgerError::NotFound {
                kind: RecordKind::Task,
                id: task.id.clone(),
            })?;
            check_task_update(&task.id, stored.status, task.status)?;
            let body = serde_json::to_string(&task)?;
            tx.execute(
                "UPDATE tasks SET status = ?1, priority = ?2, body = ?3 WHERE id = ?4",
                params![task.status, task.priority, body, task.id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_task(conn, &id)).await
    }

    async fn list_tasks(&self, status: Option<Status>) -> Result<Vec<Task>, LedgerError> {
        self.with_conn(move |conn| {
            let tasks = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT body FROM tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
                    )?;
                    let rows = stmt.query_map(params![status], body_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<Task>>>()?
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT body FROM tasks ORDER BY created_at ASC, rowid ASC")?;
                    let rows = stmt.query_map([], body_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<Task>>>()?
                }
            };
            Ok(tasks)
        })
        .await
    }

    async fn insert_experience(&self, experience: &Experience) -> Result<(), LedgerError> {
        let e = experience.clone();
        self.with_conn(move |conn| {
            let metadata = e.metadata.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                &format!(
                    "INSERT INTO experiences ({EXPERIENCE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    e.id,
                    e.agent_id,
                    e.correlation_id,
                    e.message_id,
                    serde_json::to_string(&e.initial_state)?,
                    e.action,
                    serde_json::to_string(&e.result)?,
                    serde_json::to_string(&e.next_state)?,
                    e.reward,
                    e.priority,
                    metadata,
                    e.timestamp,
                ],
            )
            .map_err(on_insert_error(RecordKind::Experience, &e.id))?;
            Ok(())
        })
        .await
    }

    async fn get_experience(&self, id: &str) -> Result<Option<Experience>, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], experience_from_row)
                .optional()?)
        })
        .await
    }

    async fn count_experiences(&self) -> Result<usize, LedgerError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM experiences", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn evict_experiences(&self, n: usize) -> Result<usize, LedgerError> {
        if n == 0 {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM experiences WHERE seq IN (\
                     SELECT seq FROM experiences \
                     ORDER BY priority ASC, timestamp ASC, seq ASC LIMIT ?1)",
                params![n as i64],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn high_priority_experiences(
        &self,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE priority >= ?1 \
                 ORDER BY priority DESC, timestamp DESC LIMIT ?2"
            );
            load_experiences(conn, &sql, params![threshold, limit as i64])
        })
        .await
    }

    async fn sample_experiences(&self, limit: usize) -> Result<Vec<Experience>, LedgerError> {
        self.with_conn(move |conn| {
            let sql =
                format!("SELECT {EXPERIENCE_COLUMNS} FROM experiences ORDER BY RANDOM() LIMIT ?1");
            load_experiences(conn, &sql, params![limit as i64])
        })
        .await
    }

    async fn agent_experiences(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE agent_id = ?1 \
                 ORDER BY timestamp DESC, seq DESC LIMIT ?2"
            );
            load_experiences(conn, &sql, params![agent_id, limit as i64])
        })
        .await
    }

    async fn update_experience_priority(
        &self,
        id: &str,
        priority: f64,
    ) -> Result<bool, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE experiences SET priority = ?1 WHERE id = ?2",
                params![priority, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError> {
        let prompt = prompt.clone();
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&prompt)?;
            conn.execute(
                "INSERT INTO master_prompts (id, is_active, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![prompt.id, prompt.is_active, prompt.created_at, body],
            )
            .map_err(on_insert_error(RecordKind::Prompt, &prompt.id))?;
            Ok(())
        })
        .await
    }

    async fn update_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError> {
        let prompt = prompt.clone();
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&prompt)?;
            let changed = conn.execute(
                "UPDATE master_prompts SET is_active = ?1, body = ?2 WHERE id = ?3",
                params![prompt.is_active, body, prompt.id],
            )?;
            if changed == 0 {
                return Err(LedgerError::NotFound {
                    kind: RecordKind::Prompt,
                    id: prompt.id.clone(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn get_prompt(&self, id: &str) -> Result<Option<MasterPrompt>, LedgerError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM master_prompts WHERE id = ?1",
                    params![id],
                    body_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_prompts(&self, active_only: bool) -> Result<Vec<MasterPrompt>, LedgerError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM master_prompts WHERE (?1 = 0 OR is_active = 1) \
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![active_only], body_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<MasterPrompt>>>()?)
        })
        .await
    }

    async fn upsert_acknowledgment(&self, ack: &PromptAcknowledgment) -> Result<(), LedgerError> {
        let ack = ack.clone();
        self.with_conn(move |conn| {
            let metadata = ack.metadata.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO prompt_acknowledgments \
                     (prompt_id, agent_id, acknowledged_at, status, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(prompt_id, agent_id) DO UPDATE SET \
                     acknowledged_at = excluded.acknowledged_at, \
                     status = excluded.status, \
                     metadata = excluded.metadata",
                params![
                    ack.prompt_id,
                    ack.agent_id,
                    ack.acknowledged_at,
                    ack.status.as_str(),
                    metadata,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_acknowledgments(
        &self,
        prompt_id: &str,
    ) -> Result<Vec<PromptAcknowledgment>, LedgerError> {
        let prompt_id = prompt_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT prompt_id, agent_id, acknowledged_at, status, metadata \
                 FROM prompt_acknowledgments WHERE prompt_id = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![prompt_id], ack_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;
    use crate::ledger::{Payload, PromptScope};
    use chrono::Duration;
    use serde_json::json;
    use tempfile::tempdir;

    fn prompt(name: &str) -> MasterPrompt {
        let now = Utc::now();
        MasterPrompt {
            id: format!("prompt_{name}"),
            version: "1.0.0".to_string(),
            name: name.to_string(),
            description: String::new(),
            content: "PRIORITIZE accuracy".to_string(),
            parameters: Some(json!({ "strict": true })),
            created_at: now,
            updated_at: now,
            expires_at: None,
            priority: Priority::High,
            scope: PromptScope::Types(vec![AgentType::Valuation]),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_message_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let mut payload = Payload::new();
        payload.insert("parcel_id".to_string(), json!("P-100"));
        let message = Message::new("mcp", "validator-1", "data-quality-check", payload)
            .with_correlation_id("corr-7");

        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.insert_message(&message).await.unwrap();
            ledger
                .update_message_status(&message.id, Status::Processing)
                .await
                .unwrap();
        }

        let reopened = SqliteLedger::open(&path).unwrap();
        let stored = reopened.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Processing);
        assert_eq!(stored.payload["parcel_id"], "P-100");
        assert_eq!(stored.correlation_id.as_deref(), Some("corr-7"));
    }

    #[tokio::test]
    async fn test_reinserting_same_id_is_duplicate() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let message = Message::new("mcp", "a1", "ping", Payload::new());
        ledger.insert_message(&message).await.unwrap();
        let err = ledger.insert_message(&message).await.unwrap_err();
        assert!(
            matches!(err, LedgerError::Duplicate { kind: RecordKind::Message, ref id } if *id == message.id)
        );
        assert!(!err.is_transient());

        let p = prompt("dup");
        ledger.insert_prompt(&p).await.unwrap();
        assert!(matches!(
            ledger.insert_prompt(&p).await,
            Err(LedgerError::Duplicate { kind: RecordKind::Prompt, .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_message_status_is_kept() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let message = Message::new("mcp", "a1", "ping", Payload::new());
        ledger.insert_message(&message).await.unwrap();
        ledger
            .update_message_status(&message.id, Status::Canceled)
            .await
            .unwrap();
        let err = ledger
            .update_message_status(&message.id, Status::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_list_messages_filters() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let a = Message::new("mcp", "a1", "ping", Payload::new());
        let b = Message::new("mcp", "a2", "ping", Payload::new());
        ledger.insert_message(&a).await.unwrap();
        ledger.insert_message(&b).await.unwrap();
        ledger
            .update_message_status(&b.id, Status::Processing)
            .await
            .unwrap();

        let pending = ledger
            .list_messages(&MessageQuery {
                status: Some(Status::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);

        let limited = ledger
            .list_messages(&MessageQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_experience_eviction_order() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, priority) in [1.0, 1.0, 1.0, 5.0].into_iter().enumerate() {
            let mut e = Experience::new("a1", "msg_1", "check", 1.0);
            e.priority = priority;
            e.timestamp = now + Duration::milliseconds(i as i64);
            ledger.insert_experience(&e).await.unwrap();
            ids.push(e.id);
        }
        assert_eq!(ledger.evict_experiences(1).await.unwrap(), 1);
        assert!(ledger.get_experience(&ids[0]).await.unwrap().is_none());
        assert!(ledger.get_experience(&ids[3]).await.unwrap().is_some());

        let top = ledger.high_priority_experiences(1.0, 1).await.unwrap();
        assert_eq!(top[0].id, ids[3]);
        assert_eq!(ledger.agent_experiences("a1", 10).await.unwrap()[0].id, ids[3]);
        assert_eq!(ledger.sample_experiences(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_task_and_prompt_bodies() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let mut task = Task::new("tax", "levy-estimate", Payload::new());
        task.priority = Priority::High;
        ledger.insert_task(&task).await.unwrap();
        task.status = Status::Processing;
        ledger.update_task(&task).await.unwrap();
        assert_eq!(
            ledger.list_tasks(Some(Status::Processing)).await.unwrap().len(),
            1
        );

        let mut p = prompt("valuation-rules");
        ledger.insert_prompt(&p).await.unwrap();
        p.is_active = false;
        ledger.update_prompt(&p).await.unwrap();
        assert!(ledger.list_prompts(true).await.unwrap().is_empty());
        let stored = ledger.get_prompt(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.scope, PromptScope::Types(vec![AgentType::Valuation]));

        let missing = prompt("missing");
        assert!(matches!(
            ledger.update_prompt(&missing).await.unwrap_err(),
            LedgerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_acknowledgment_upsert() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let mut ack = PromptAcknowledgment {
            prompt_id: "prompt_1".to_string(),
            agent_id: "a1".to_string(),
            acknowledged_at: Utc::now(),
            status: AckStatus::Received,
            metadata: None,
        };
        ledger.upsert_acknowledgment(&ack).await.unwrap();
        ack.status = AckStatus::Confirmed;
        ledger.upsert_acknowledgment(&ack).await.unwrap();
        let rows = ledger.list_acknowledgments("prompt_1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AckStatus::Confirmed);
    }
}
