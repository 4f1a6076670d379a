//! 台账记录类型：Message / Task / Experience / MasterPrompt / PromptAcknowledgment
//!
//! 这些记录由编排器创建并经 Ledger 持久化；状态只能沿 PENDING → PROCESSING → 终态 单调推进。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::agent::{AgentRequest, AgentType, RequestMetadata};
use crate::core::ErrorInfo;

/// 开放的键值负载
pub type Payload = Map<String, Value>;

/// 广播消息的收件人标记
pub const BROADCAST_RECIPIENT: &str = "*";

/// 优先级（声明顺序即大小：Low < Medium < High）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(Priority::Low),
            "MEDIUM" | "NORMAL" => Some(Priority::Medium),
            "HIGH" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息 / 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Status::Pending),
            "PROCESSING" => Some(Status::Processing),
            "COMPLETED" => Some(Status::Completed),
            "FAILED" => Some(Status::Failed),
            "CANCELED" | "CANCELLED" => Some(Status::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Processing => 1,
            Status::Completed | Status::Failed | Status::Canceled => 2,
        }
    }

    /// 只允许向前推进；终态不可再被覆盖
    pub fn can_transition_to(&self, next: Status) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排器创建的消息记录；Agent 永远不会修改它
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sender_id: String,
    /// 收件 Agent ID，或广播标记 `*`
    pub recipient_id: String,
    pub message_type: String,
    pub priority: Priority,
    pub payload: Payload,
    pub status: Status,
    pub correlation_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            created_at: now,
            updated_at: now,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type: message_type.into(),
            priority: Priority::default(),
            payload,
            status: Status::Pending,
            correlation_id: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST_RECIPIENT
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// 把寻址消息直接映射为 Agent 请求：action 取 payload.action，缺省为消息类型
    pub fn to_request(&self) -> AgentRequest {
        let action = self
            .payload
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.message_type.clone());
        AgentRequest {
            request_type: self.message_type.clone(),
            action,
            priority: self.priority,
            payload: self.payload.clone(),
            metadata: Some(RequestMetadata {
                correlation_id: self.correlation_id.clone(),
                requester_id: Some(self.sender_id.clone()),
                idempotency_key: None,
                extra: Payload::new(),
            }),
        }
    }
}

/// 调度任务：进入优先级队列，出队时转成请求分发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub action: String,
    pub payload: Payload,
    pub priority: Priority,
    pub status: Status,
    /// 指定的目标 Agent；为空时按类型推断
    pub target_agent_id: Option<String>,
    /// 实际处理的 Agent
    pub assigned_agent_id: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, action: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            task_type: task_type.into(),
            action: action.into(),
            payload,
            priority: Priority::default(),
            status: Status::Pending,
            target_agent_id: None,
            assigned_agent_id: None,
            correlation_id: None,
            message_id: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_request(&self) -> AgentRequest {
        AgentRequest {
            request_type: self.task_type.clone(),
            action: self.action.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            metadata: Some(RequestMetadata {
                correlation_id: self.correlation_id.clone(),
                requester_id: None,
                idempotency_key: Some(self.id.clone()),
                extra: Payload::new(),
            }),
        }
    }
}

/// 一次 Agent 交互的经验 (state, action, result, reward)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub agent_id: String,
    pub correlation_id: Option<String>,
    /// 产生该经验的消息
    pub message_id: String,
    pub initial_state: Value,
    pub action: String,
    pub result: Value,
    pub next_state: Value,
    pub reward: f64,
    pub priority: f64,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Experience {
    pub fn new(
        agent_id: impl Into<String>,
        message_id: impl Into<String>,
        action: impl Into<String>,
        reward: f64,
    ) -> Self {
        Self {
            id: format!("exp_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.into(),
            correlation_id: None,
            message_id: message_id.into(),
            initial_state: Value::Null,
            action: action.into(),
            result: Value::Null,
            next_state: Value::Null,
            reward,
            priority: 0.0,
            metadata: None,
            timestamp: Utc::now(),
        }
    }
}

/// 主提示的投放范围："ALL" 或显式的 Agent 类型列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptScope {
    All,
    Types(Vec<AgentType>),
}

impl PromptScope {
    pub fn includes(&self, agent_type: AgentType) -> bool {
        match self {
            PromptScope::All => true,
            PromptScope::Types(types) => types.contains(&agent_type),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeRepr {
    Keyword(String),
    Types(Vec<AgentType>),
}

impl Serialize for PromptScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PromptScope::All => ScopeRepr::Keyword("ALL".to_string()).serialize(serializer),
            PromptScope::Types(types) => ScopeRepr::Types(types.clone()).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PromptScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ScopeRepr::deserialize(deserializer)? {
            ScopeRepr::Keyword(k) if k.eq_ignore_ascii_case("ALL") => Ok(PromptScope::All),
            ScopeRepr::Keyword(k) => Err(serde::de::Error::custom(format!(
                "unknown prompt scope keyword: {k}"
            ))),
            ScopeRepr::Types(types) => Ok(PromptScope::Types(types)),
        }
    }
}

/// 系统级指令文档；撤销是软删除（is_active = false，记录保留）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterPrompt {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    /// 自由文本，可内嵌 Agent 自行解析的指令关键字
    pub content: String,
    pub parameters: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub scope: PromptScope,
    pub is_active: bool,
}

impl MasterPrompt {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// 当前是否有效：未撤销且未过期
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    /// receive_master_prompt 返回 true
    Received,
    /// 且 confirm_prompt_acknowledgment 也返回 true
    Confirmed,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Received => "RECEIVED",
            AckStatus::Confirmed => "CONFIRMED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RECEIVED" => Some(AckStatus::Received),
            "CONFIRMED" => Some(AckStatus::Confirmed),
            _ => None,
        }
    }
}

/// 主提示确认记录；按 (prompt_id, agent_id) 去重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAcknowledgment {
    pub prompt_id: String,
    pub agent_id: String,
    pub acknowledged_at: DateTime<Utc>,
    pub status: AckStatus,
    pub metadata: Option<Value>,
}

/// 消息查询条件（结果按创建时间升序）
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub status: Option<Status>,
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn matches(&self, message: &Message) -> bool {
        self.status.map_or(true, |s| message.status == s)
            && self
                .sender_id
                .as_deref()
                .map_or(true, |s| message.sender_id == s)
            && self
                .recipient_id
                .as_deref()
                .map_or(true, |r| message.recipient_id == r)
            && self
                .correlation_id
                .as_deref()
                .map_or(true, |c| message.correlation_id.as_deref() == Some(c))
            && self.since.map_or(true, |since| message.created_at >= since)
    }
}
