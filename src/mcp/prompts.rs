//! 主提示分发
//!
//! 广播目标解析顺序：显式 target_agent_ids → scope 为 ALL 时全部活跃 Agent → scope 中类型的活跃 Agent。
//! 对每个目标调用可选的 PromptReceiver；没有该能力的 Agent 静默跳过。
//! 确认记录按 (prompt_id, agent_id) 覆盖写入。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::MasterControlProgram;
use crate::agent::Agent;
use crate::core::{EventType, McpError};
use crate::ledger::{AckStatus, MasterPrompt, Priority, PromptAcknowledgment, PromptScope};

pub const DEFAULT_PROMPT_VERSION: &str = "1.0.0";

/// 创建主提示的参数
#[derive(Debug, Clone)]
pub struct NewMasterPrompt {
    pub name: String,
    pub description: String,
    pub content: String,
    pub parameters: Option<Value>,
    /// 不指定时为 1.0.0
    pub version: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub scope: PromptScope,
}

impl NewMasterPrompt {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            content: content.into(),
            parameters: None,
            version: None,
            expires_at: None,
            priority: Priority::default(),
            scope: PromptScope::All,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_scope(mut self, scope: PromptScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// 局部更新；None 的字段保持不变
#[derive(Debug, Clone, Default)]
pub struct MasterPromptPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub parameters: Option<Value>,
    /// 不指定时自动递增补丁号
    pub version: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    pub scope: Option<PromptScope>,
}

/// "1.2.3" → "1.2.4"；最后一段不是数字时追加 ".1"
fn bump_patch(version: &str) -> String {
    match version.rsplit_once('.') {
        Some((head, last)) => match last.parse::<u64>() {
            Ok(n) => format!("{head}.{}", n + 1),
            Err(_) => format!("{version}.1"),
        },
        None => match version.parse::<u64>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => format!("{version}.1"),
        },
    }
}

impl MasterControlProgram {
    pub async fn create_master_prompt(
        &self,
        new_prompt: NewMasterPrompt,
    ) -> Result<MasterPrompt, McpError> {
        if new_prompt.name.trim().is_empty() {
            return Err(McpError::InvalidArgument(
                "master prompt name must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let prompt = MasterPrompt {
            id: format!("prompt_{}", uuid::Uuid::new_v4()),
            version: new_prompt
                .version
                .unwrap_or_else(|| DEFAULT_PROMPT_VERSION.to_string()),
            name: new_prompt.name,
            description: new_prompt.description,
            content: new_prompt.content,
            parameters: new_prompt.parameters,
            created_at: now,
            updated_at: now,
            expires_at: new_prompt.expires_at,
            priority: new_prompt.priority,
            scope: new_prompt.scope,
            is_active: true,
        };

        self.retry
            .run_insert("insert_prompt", || self.ledger.insert_prompt(&prompt))
            .await?;
        tracing::info!(prompt_id = %prompt.id, name = %prompt.name, version = %prompt.version, "Master prompt created");
        self.events.emit(
            EventType::MasterPromptUpdated,
            json!({ "prompt_id": prompt.id, "action": "created", "version": prompt.version }),
        );
        Ok(prompt)
    }

    pub async fn update_master_prompt(
        &self,
        prompt_id: &str,
        patch: MasterPromptPatch,
    ) -> Result<MasterPrompt, McpError> {
        let mut prompt = self.get_master_prompt(prompt_id).await?;
        if let Some(name) = patch.name {
            prompt.name = name;
        }
        if let Some(description) = patch.description {
            prompt.description = description;
        }
        if let Some(content) = patch.content {
            prompt.content = content;
        }
        if let Some(parameters) = patch.parameters {
            prompt.parameters = Some(parameters);
        }
        if let Some(expires_at) = patch.expires_at {
            prompt.expires_at = Some(expires_at);
        }
        if let Some(priority) = patch.priority {
            prompt.priority = priority;
        }
        if let Some(scope) = patch.scope {
            prompt.scope = scope;
        }
        prompt.version = patch
            .version
            .unwrap_or_else(|| bump_patch(&prompt.version));
        prompt.updated_at = Utc::now();

        self.retry
            .run("update_prompt", || self.ledger.update_prompt(&prompt))
            .await?;
        tracing::info!(prompt_id, version = %prompt.version, "Master prompt updated");
        self.events.emit(
            EventType::MasterPromptUpdated,
            json!({ "prompt_id": prompt_id, "action": "updated", "version": prompt.version }),
        );
        Ok(prompt)
    }

    pub async fn get_master_prompt(&self, prompt_id: &str) -> Result<MasterPrompt, McpError> {
        self.retry
            .run("get_prompt", || self.ledger.get_prompt(prompt_id))
            .await?
            .ok_or_else(|| McpError::PromptNotFound(prompt_id.to_string()))
    }

    /// 当前生效（未撤销、未过期）的主提示，按创建时间升序
    pub async fn get_active_master_prompts(&self) -> Result<Vec<MasterPrompt>, McpError> {
        let now = Utc::now();
        let prompts = self
            .retry
            .run("list_prompts", || self.ledger.list_prompts(true))
            .await?;
        Ok(prompts.into_iter().filter(|p| p.is_effective(now)).collect())
    }

    /// 广播主提示，返回确认的 Agent 数；单个 Agent 投递失败不会让整体出错
    pub async fn broadcast_master_prompt(
        &self,
        prompt_id: &str,
        target_agent_ids: Option<&[String]>,
    ) -> Result<usize, McpError> {
        let prompt = self.get_master_prompt(prompt_id).await?;
        if !prompt.is_effective(Utc::now()) {
            return Err(McpError::PromptInactive(prompt_id.to_string()));
        }

        let targets = self.resolve_prompt_targets(&prompt, target_agent_ids).await;
        let mut acknowledged = 0;
        for agent in &targets {
            if self.deliver_prompt(agent.as_ref(), &prompt).await {
                acknowledged += 1;
            }
        }

        tracing::info!(
            prompt_id,
            targets = targets.len(),
            acknowledged,
            "Master prompt broadcast"
        );
        self.events.emit(
            EventType::DirectiveBroadcast,
            json!({
                "prompt_id": prompt_id,
                "version": prompt.version,
                "targets": targets.len(),
                "acknowledged": acknowledged,
            }),
        );
        Ok(acknowledged)
    }

    /// 撤销：软删除，已产生的确认记录保留
    pub async fn revoke_master_prompt(&self, prompt_id: &str) -> Result<MasterPrompt, McpError> {
        let mut prompt = self.get_master_prompt(prompt_id).await?;
        prompt.is_active = false;
        prompt.updated_at = Utc::now();
        self.retry
            .run("update_prompt", || self.ledger.update_prompt(&prompt))
            .await?;
        tracing::info!(prompt_id, "Master prompt revoked");
        self.events.emit(
            EventType::MasterPromptUpdated,
            json!({ "prompt_id": prompt_id, "action": "revoked" }),
        );
        Ok(prompt)
    }

    pub async fn prompt_acknowledgments(
        &self,
        prompt_id: &str,
    ) -> Result<Vec<PromptAcknowledgment>, McpError> {
        self.retry
            .run("list_acknowledgments", || {
                self.ledger.list_acknowledgments(prompt_id)
            })
            .await
    }

    /// 显式目标只要已注册就投递（不论是否活跃），未知 ID 跳过
    async fn resolve_prompt_targets(
        &self,
        prompt: &MasterPrompt,
        target_agent_ids: Option<&[String]>,
    ) -> Vec<Arc<dyn Agent>> {
        match target_agent_ids {
            Some(ids) => {
                let mut agents = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.registry.get(id).await {
                        Some(agent) => agents.push(agent),
                        None => tracing::debug!(prompt_id = %prompt.id, agent_id = %id, "Unknown prompt target skipped"),
                    }
                }
                agents
            }
            None => self
                .registry
                .active()
                .await
                .into_iter()
                .filter(|agent| prompt.scope.includes(agent.agent_type()))
                .collect(),
        }
    }

    /// 投递给单个 Agent，返回是否确认
    async fn deliver_prompt(&self, agent: &dyn Agent, prompt: &MasterPrompt) -> bool {
        let Some(receiver) = agent.prompt_receiver() else {
            return false;
        };

        let received = match self
            .guarded(agent.id(), receiver.receive_master_prompt(prompt))
            .await
        {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(prompt_id = %prompt.id, agent_id = %agent.id(), error = %e, "Prompt delivery failed");
                self.events.emit(
                    EventType::ErrorOccurred,
                    json!({ "prompt_id": prompt.id, "agent_id": agent.id(), "error": e.to_info() }),
                );
                false
            }
        };
        if !received {
            return false;
        }

        let confirmed = self
            .guarded(
                agent.id(),
                receiver.confirm_prompt_acknowledgment(&prompt.id),
            )
            .await
            .unwrap_or(false);
        let ack = PromptAcknowledgment {
            prompt_id: prompt.id.clone(),
            agent_id: agent.id().to_string(),
            acknowledged_at: Utc::now(),
            status: if confirmed {
                AckStatus::Confirmed
            } else {
                AckStatus::Received
            },
            metadata: Some(json!({ "version": prompt.version })),
        };
        if let Err(e) = self
            .retry
            .run("upsert_acknowledgment", || {
                self.ledger.upsert_acknowledgment(&ack)
            })
            .await
        {
            tracing::warn!(prompt_id = %prompt.id, agent_id = %agent.id(), error = %e, "Acknowledgment not persisted");
            self.events.emit(
                EventType::ErrorOccurred,
                json!({ "prompt_id": prompt.id, "agent_id": agent.id(), "error": e.to_info() }),
            );
        }
        tracing::debug!(prompt_id = %prompt.id, agent_id = %agent.id(), status = ack.status.as_str(), "Prompt acknowledged");
        true
    }
}
