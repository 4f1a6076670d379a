//! Agent 类型与请求 / 响应值类型（不持久化）

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ErrorInfo;
use crate::ledger::{Payload, Priority};

/// 固定的 Agent 领域类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    DataValidation,
    Valuation,
    TaxInformation,
    Workflow,
    LegalCompliance,
    UserInteraction,
    MapIntelligence,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::DataValidation,
        AgentType::Valuation,
        AgentType::TaxInformation,
        AgentType::Workflow,
        AgentType::LegalCompliance,
        AgentType::UserInteraction,
        AgentType::MapIntelligence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::DataValidation => "DATA_VALIDATION",
            AgentType::Valuation => "VALUATION",
            AgentType::TaxInformation => "TAX_INFORMATION",
            AgentType::Workflow => "WORKFLOW",
            AgentType::LegalCompliance => "LEGAL_COMPLIANCE",
            AgentType::UserInteraction => "USER_INTERACTION",
            AgentType::MapIntelligence => "MAP_INTELLIGENCE",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求元数据：关联 ID 端到端传递
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub extra: Payload,
}

/// 发给 Agent 的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    pub action: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
}

impl AgentRequest {
    pub fn new(request_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            action: action.into(),
            priority: Priority::default(),
            payload: Payload::new(),
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// 追加单个负载字段
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata_mut().correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.metadata_mut().requester_id = Some(requester_id.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.correlation_id.as_deref())
    }

    pub fn requester_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.requester_id.as_deref())
    }

    pub fn metadata_mut(&mut self) -> &mut RequestMetadata {
        self.metadata.get_or_insert_with(RequestMetadata::default)
    }
}

/// Agent 的响应；失败时 error 携带结构化错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl AgentResponse {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            message_id: None,
            correlation_id: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            success: false,
            message_id: None,
            correlation_id: None,
            data: None,
            error: Some(error),
        }
    }

    /// 编排器在返回前补上消息 ID 与关联 ID
    pub fn with_ids(mut self, message_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        self.message_id = Some(message_id.into());
        if correlation_id.is_some() {
            self.correlation_id = correlation_id;
        }
        self
    }

    pub fn error_code(&self) -> Option<crate::core::ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_type_field() {
        let request = AgentRequest::new("tax-levy", "estimate")
            .with_param("parcel_id", json!("P-1"))
            .with_correlation_id("corr-1");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "tax-levy");
        assert_eq!(value["priority"], "MEDIUM");
        assert_eq!(value["metadata"]["correlation_id"], "corr-1");
    }

    #[test]
    fn test_with_ids_keeps_agent_correlation_when_none_given() {
        let mut response = AgentResponse::success(json!({ "ok": true }));
        response.correlation_id = Some("from-agent".to_string());
        let response = response.with_ids("msg_1", None);
        assert_eq!(response.message_id.as_deref(), Some("msg_1"));
        assert_eq!(response.correlation_id.as_deref(), Some("from-agent"));
    }

    #[test]
    fn test_agent_type_screaming_names() {
        assert_eq!(
            serde_json::to_value(AgentType::LegalCompliance).unwrap(),
            json!("LEGAL_COMPLIANCE")
        );
        assert_eq!(AgentType::ALL.len(), 7);
    }
}
