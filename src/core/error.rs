//! 编排层错误类型与对外错误码
//!
//! McpError 是内部传播用的错误；对调用方一律返回结构化的 ErrorInfo（code + message + details），
//! 由 McpError::to_info 投影得到。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::ledger::{LedgerError, RecordKind, Status};

/// 对外稳定的错误码（序列化为 NO_AGENT_AVAILABLE 这种大写下划线形式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoAgentAvailable,
    AgentNotFound,
    MessageNotFound,
    TaskNotFound,
    PromptNotFound,
    PromptInactive,
    ValidationFailed,
    AgentError,
    AgentTimeout,
    Canceled,
    PersistenceError,
    PersistenceTimeout,
    InvalidStatusTransition,
    ConfigError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoAgentAvailable => "NO_AGENT_AVAILABLE",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::MessageNotFound => "MESSAGE_NOT_FOUND",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::PromptNotFound => "PROMPT_NOT_FOUND",
            ErrorCode::PromptInactive => "PROMPT_INACTIVE",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::AgentError => "AGENT_ERROR",
            ErrorCode::AgentTimeout => "AGENT_TIMEOUT",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::PersistenceTimeout => "PERSISTENCE_TIMEOUT",
            ErrorCode::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用方可见的结构化错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// 编排过程中可能出现的错误（路由、校验、Agent 调用、持久化）
#[derive(Error, Debug)]
pub enum McpError {
    #[error("No active agent available: {0}")]
    NoAgentAvailable(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Master prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Master prompt is not active: {0}")]
    PromptInactive(String),

    #[error("Request rejected for agent {agent_id}: {}", violations.join("; "))]
    ValidationFailed {
        agent_id: String,
        violations: Vec<String>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Agent call failed: {0}")]
    AgentCall(String),

    #[error("Agent {agent_id} timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Persistence failed during {operation}: {source}")]
    Persistence {
        operation: String,
        #[source]
        source: LedgerError,
    },

    #[error("Persistence timed out during {operation} after {attempts} attempts")]
    PersistenceTimeout { operation: String, attempts: u32 },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// 将持久化错误映射为编排层错误：不存在 / 非法迁移单独区分，其余归为持久化失败
    pub fn from_ledger(operation: &str, err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { kind, id } => match kind {
                RecordKind::Message => McpError::MessageNotFound(id),
                RecordKind::Task => McpError::TaskNotFound(id),
                RecordKind::Prompt => McpError::PromptNotFound(id),
                _ => McpError::Persistence {
                    operation: operation.to_string(),
                    source: LedgerError::NotFound { kind, id },
                },
            },
            LedgerError::InvalidTransition { id, from, to } => {
                McpError::InvalidTransition { id, from, to }
            }
            other => McpError::Persistence {
                operation: operation.to_string(),
                source: other,
            },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            McpError::NoAgentAvailable(_) => ErrorCode::NoAgentAvailable,
            McpError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            McpError::MessageNotFound(_) => ErrorCode::MessageNotFound,
            McpError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            McpError::PromptNotFound(_) => ErrorCode::PromptNotFound,
            McpError::PromptInactive(_) => ErrorCode::PromptInactive,
            McpError::ValidationFailed { .. } | McpError::InvalidArgument(_) => {
                ErrorCode::ValidationFailed
            }
            McpError::AgentCall(_) => ErrorCode::AgentError,
            McpError::AgentTimeout { .. } => ErrorCode::AgentTimeout,
            McpError::Canceled(_) => ErrorCode::Canceled,
            McpError::Persistence { .. } => ErrorCode::PersistenceError,
            McpError::PersistenceTimeout { .. } => ErrorCode::PersistenceTimeout,
            McpError::InvalidTransition { .. } => ErrorCode::InvalidStatusTransition,
            McpError::Config(_) => ErrorCode::ConfigError,
            McpError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// 投影为对外的结构化错误；部分错误附带 details
    pub fn to_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.code(), self.to_string());
        match self {
            McpError::ValidationFailed {
                agent_id,
                violations,
            } => info.with_details(json!({
                "agent_id": agent_id,
                "violations": violations,
            })),
            McpError::AgentTimeout {
                agent_id,
                timeout_ms,
            } => info.with_details(json!({
                "agent_id": agent_id,
                "timeout_ms": timeout_ms,
            })),
            McpError::InvalidTransition { id, from, to } => info.with_details(json!({
                "id": id,
                "from": from.as_str(),
                "to": to.as_str(),
            })),
            McpError::PersistenceTimeout {
                operation,
                attempts,
            } => info.with_details(json!({
                "operation": operation,
                "attempts": attempts,
            })),
            _ => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::NoAgentAvailable).unwrap();
        assert_eq!(json, "\"NO_AGENT_AVAILABLE\"");
        assert_eq!(ErrorCode::PromptNotFound.as_str(), "PROMPT_NOT_FOUND");
    }

    #[test]
    fn test_ledger_not_found_maps_to_domain_code() {
        let err = McpError::from_ledger(
            "get_prompt",
            LedgerError::NotFound {
                kind: RecordKind::Prompt,
                id: "prompt_1".to_string(),
            },
        );
        assert_eq!(err.code(), ErrorCode::PromptNotFound);
    }

    #[test]
    fn test_storage_error_maps_to_persistence() {
        let err = McpError::from_ledger(
            "insert_message",
            LedgerError::Storage("disk full".to_string()),
        );
        assert_eq!(err.code(), ErrorCode::PersistenceError);
        assert!(err.to_string().contains("insert_message"));
    }

    #[test]
    fn test_validation_info_carries_violations() {
        let err = McpError::ValidationFailed {
            agent_id: "validator-1".to_string(),
            violations: vec!["missing required parameter 'parcel_id'".to_string()],
        };
        let info = err.to_info();
        assert_eq!(info.code, ErrorCode::ValidationFailed);
        let details = info.details.unwrap();
        assert_eq!(details["violations"][0], "missing required parameter 'parcel_id'");
    }
}
