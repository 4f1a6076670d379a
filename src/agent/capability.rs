//! Agent 能力契约
//!
//! 必需方法放在 `Agent` trait 中；可选能力拆成独立 trait，
//! 通过 `behavior_updater()` 等访问器以 `Option<&dyn Trait>` 暴露，调用时判断是否存在。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentRequest, AgentResponse, AgentType};
use crate::ledger::{MasterPrompt, Payload};
use crate::training::AgentRecommendation;

/// 参数的 JSON 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
            ParamKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// 分发前用于校验负载的参数形状
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterShape {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl ParameterShape {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// 返回全部违规项，而不是遇到第一个就停
    pub fn validate(&self, payload: &Payload) -> Result<(), Vec<String>> {
        let violations: Vec<String> = self
            .params
            .iter()
            .filter_map(|spec| match payload.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    Some(format!("missing required parameter '{}'", spec.name))
                }
                None | Some(Value::Null) => None,
                Some(value) if !spec.kind.matches(value) => Some(format!(
                    "parameter '{}' should be {:?}",
                    spec.name, spec.kind
                )),
                Some(_) => None,
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Agent 声明的能力，声明后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub parameters: ParameterShape,
    #[serde(default)]
    pub requires_auth: bool,
    /// 每分钟调用上限（仅声明）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

impl AgentCapability {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            category: category.into(),
            parameters: ParameterShape::default(),
            requires_auth: false,
            rate_limit: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, params: Vec<ParamSpec>) -> Self {
        self.parameters = ParameterShape::new(params);
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = Some(per_minute);
        self
    }

    /// 能力 ID 或名称与 action 相同即视为匹配
    pub fn handles(&self, action: &str) -> bool {
        self.id == action || self.name == action
    }

    /// 校验请求：参数形状 + 鉴权要求（需要请求方 ID）
    pub fn check(&self, request: &AgentRequest) -> Result<(), Vec<String>> {
        let mut violations = match self.parameters.validate(&request.payload) {
            Ok(()) => Vec::new(),
            Err(v) => v,
        };
        if self.requires_auth && request.requester_id().is_none() {
            violations.push(format!("capability '{}' requires an authenticated requester", self.id));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// 所有 Agent 必须实现的契约
///
/// `handle_request` 不应 panic，内部错误应返回结构化失败响应；
/// 即便 panic，编排器也会捕获并转成 AGENT_ERROR。
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn agent_type(&self) -> AgentType;

    fn is_active(&self) -> bool;

    fn capabilities(&self) -> Vec<AgentCapability>;

    async fn initialize(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}

    /// Agent 自己的请求校验（在参数形状校验之后）
    async fn validate_request(&self, _request: &AgentRequest) -> bool {
        true
    }

    async fn handle_request(&self, request: AgentRequest) -> AgentResponse;

    async fn status(&self) -> Value;

    /// 尽力而为的取消通知；返回 Agent 是否确实停止了工作
    async fn cancel_request(&self, _message_id: &str) -> bool {
        false
    }

    fn behavior_updater(&self) -> Option<&dyn BehaviorUpdater> {
        None
    }

    fn prompt_receiver(&self) -> Option<&dyn PromptReceiver> {
        None
    }

    fn assistance_provider(&self) -> Option<&dyn AssistanceProvider> {
        None
    }
}

/// 可选：接收训练产出的策略建议
#[async_trait]
pub trait BehaviorUpdater: Send + Sync {
    async fn update_behavior(&self, recommendation: &AgentRecommendation) -> bool;
}

/// 可选：接收主提示
#[async_trait]
pub trait PromptReceiver: Send + Sync {
    async fn receive_master_prompt(&self, prompt: &MasterPrompt) -> bool;

    async fn confirm_prompt_acknowledgment(&self, _prompt_id: &str) -> bool {
        false
    }
}

/// 可选：为其他 Agent 提供协助
#[async_trait]
pub trait AssistanceProvider: Send + Sync {
    async fn provide_assistance(&self, requester_id: &str, request: &AgentRequest)
        -> AgentResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape() -> ParameterShape {
        ParameterShape::new(vec![
            ParamSpec::required("parcel_id", ParamKind::String),
            ParamSpec::required("area", ParamKind::Number),
            ParamSpec::optional("tags", ParamKind::Array),
        ])
    }

    #[test]
    fn test_validate_accepts_well_formed_payload() {
        let mut payload = Payload::new();
        payload.insert("parcel_id".into(), json!("P-1"));
        payload.insert("area".into(), json!(120.5));
        assert!(shape().validate(&payload).is_ok());
    }

    #[test]
    fn test_validate_lists_every_violation() {
        let mut payload = Payload::new();
        payload.insert("area".into(), json!("large"));
        payload.insert("tags".into(), json!("not-an-array"));
        let violations = shape().validate(&payload).unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("parcel_id"));
    }

    #[test]
    fn test_auth_capability_requires_requester() {
        let capability = AgentCapability::new("approve-levy", "tax").with_auth();
        let anonymous = AgentRequest::new("tax", "approve-levy");
        assert!(capability.check(&anonymous).is_err());
        let signed = anonymous.with_requester("clerk-7");
        assert!(capability.check(&signed).is_ok());
    }

    #[test]
    fn test_capability_matches_by_id_or_name() {
        let mut capability = AgentCapability::new("check-parcel", "validation");
        capability.name = "Parcel Check".to_string();
        assert!(capability.handles("check-parcel"));
        assert!(capability.handles("Parcel Check"));
        assert!(!capability.handles("other"));
    }
}
