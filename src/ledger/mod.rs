//! 台账（持久化协作方）
//!
//! 记录每条 Message / Task 的状态迁移，以及 Experience、MasterPrompt、确认记录。
//! - `MemoryLedger`：进程内实现，默认后端与测试使用
//! - `SqliteLedger`：rusqlite 落盘，阻塞操作放在 spawn_blocking 中
//!
//! 两个后端都强制状态单调推进：终态不可被覆盖。

mod memory;
mod records;
mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{LedgerBackend, LedgerSection};

pub use memory::MemoryLedger;
pub use records::{
    AckStatus, Experience, MasterPrompt, Message, MessageQuery, Payload, Priority,
    PromptAcknowledgment, PromptScope, Status, Task, BROADCAST_RECIPIENT,
};
pub use sqlite::SqliteLedger;

/// 记录种类（用于 NotFound 等错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
    Task,
    Experience,
    Prompt,
    Acknowledgment,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Message => "message",
            RecordKind::Task => "task",
            RecordKind::Experience => "experience",
            RecordKind::Prompt => "prompt",
            RecordKind::Acknowledgment => "acknowledgment",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("Duplicate {kind}: {id}")]
    Duplicate { kind: RecordKind, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl LedgerError {
    /// 是否值得重试（存储抖动 / 阻塞任务失败）
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_) | LedgerError::Join(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// 持久化接口：按 id 点查，按状态 / 发送方 / Agent / 优先级 / 时间范围查询
#[async_trait]
pub trait Ledger: Send + Sync {
    // ---- Message ----
    async fn insert_message(&self, message: &Message) -> Result<(), LedgerError>;

    /// 推进消息状态，返回更新后的记录；非法迁移返回 InvalidTransition
    async fn update_message_status(&self, id: &str, status: Status)
        -> Result<Message, LedgerError>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>, LedgerError>;

    /// 按创建时间升序
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, LedgerError>;

    // ---- Task ----
    async fn insert_task(&self, task: &Task) -> Result<(), LedgerError>;

    /// 整条覆盖；状态只允许前进，或保持同一个非终态
    async fn update_task(&self, task: &Task) -> Result<(), LedgerError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, LedgerError>;

    async fn list_tasks(&self, status: Option<Status>) -> Result<Vec<Task>, LedgerError>;

    // ---- Experience ----
    async fn insert_experience(&self, experience: &Experience) -> Result<(), LedgerError>;

    async fn get_experience(&self, id: &str) -> Result<Option<Experience>, LedgerError>;

    async fn count_experiences(&self) -> Result<usize, LedgerError>;

    /// 删除 n 条：优先级升序，其次时间升序，再次插入顺序；返回实际删除数
    async fn evict_experiences(&self, n: usize) -> Result<usize, LedgerError>;

    /// priority >= threshold，按优先级降序、时间降序
    async fn high_priority_experiences(
        &self,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError>;

    /// 均匀随机抽样
    async fn sample_experiences(&self, limit: usize) -> Result<Vec<Experience>, LedgerError>;

    /// 某 Agent 最近的经验，时间降序
    async fn agent_experiences(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError>;

    /// 返回是否找到该经验
    async fn update_experience_priority(&self, id: &str, priority: f64)
        -> Result<bool, LedgerError>;

    // ---- MasterPrompt ----
    async fn insert_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError>;

    async fn update_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError>;

    async fn get_prompt(&self, id: &str) -> Result<Option<MasterPrompt>, LedgerError>;

    /// 按创建时间升序
    async fn list_prompts(&self, active_only: bool) -> Result<Vec<MasterPrompt>, LedgerError>;

    // ---- Acknowledgment ----
    /// 按 (prompt_id, agent_id) 插入或覆盖
    async fn upsert_acknowledgment(&self, ack: &PromptAcknowledgment) -> Result<(), LedgerError>;

    async fn list_acknowledgments(
        &self,
        prompt_id: &str,
    ) -> Result<Vec<PromptAcknowledgment>, LedgerError>;
}

/// 按配置创建台账后端
pub fn create_ledger(section: &LedgerSection) -> Result<Arc<dyn Ledger>, LedgerError> {
    match section.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new())),
        LedgerBackend::Sqlite => {
            let ledger = SqliteLedger::open(&section.sqlite_path)?;
            tracing::info!(path = %section.sqlite_path.display(), "SQLite ledger opened");
            Ok(Arc::new(ledger))
        }
    }
}

/// 状态迁移检查（两个后端共用）
pub(crate) fn check_transition(id: &str, from: Status, to: Status) -> Result<(), LedgerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

/// 任务整条更新时的状态检查：允许前进，或停留在同一个非终态
pub(crate) fn check_task_update(id: &str, from: Status, to: Status) -> Result<(), LedgerError> {
    if from == to && !from.is_terminal() {
        return Ok(());
    }
    check_transition(id, from, to)
}
