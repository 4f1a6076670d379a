//! 分发、路由与广播
//!
//! 单个请求的状态机：SUBMITTED → AGENT_SELECTED → PERSISTED → DELIVERED → (COMPLETED | FAILED)。
//! 步骤内的未处理错误只在顶层捕获一次：消息（如已创建）标记 FAILED，发出 ERROR_OCCURRED，
//! 返回结构化失败响应。编排器不自动重试 Agent 调用。

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;

use super::{MasterControlProgram, MCP_SENDER_ID};
use crate::agent::{infer_agent_type, Agent, AgentRequest, AgentResponse};
use crate::core::{ErrorCode, ErrorInfo, EventType, McpError};
use crate::ledger::{Experience, LedgerError, Message, Status};

/// 带上下文的分发失败：记录消息是否已经落库
struct DispatchFailure {
    error: McpError,
    message_id: Option<String>,
}

impl DispatchFailure {
    fn before_persist(error: McpError) -> Self {
        Self {
            error,
            message_id: None,
        }
    }

    fn for_message(error: McpError, message_id: &str) -> Self {
        Self {
            error,
            message_id: Some(message_id.to_string()),
        }
    }

    /// 插入失败：记录可能已落库，需要标记；同 ID 记录早已存在时不能动它
    fn after_insert(error: McpError, message_id: &str) -> Self {
        if is_duplicate(&error) {
            Self::before_persist(error)
        } else {
            Self::for_message(error, message_id)
        }
    }
}

fn new_correlation_id() -> String {
    format!("corr_{}", uuid::Uuid::new_v4())
}

fn is_duplicate(err: &McpError) -> bool {
    matches!(
        err,
        McpError::Persistence {
            source: LedgerError::Duplicate { .. },
            ..
        }
    )
}

/// 消息已被取消时的状态迁移错误
fn is_canceled(err: &McpError) -> bool {
    matches!(
        err,
        McpError::InvalidTransition {
            from: Status::Canceled,
            ..
        }
    )
}

fn canceled_response(message: &Message) -> AgentResponse {
    AgentResponse::failure(
        McpError::Canceled(format!("message {} was canceled", message.id)).to_info(),
    )
    .with_ids(message.id.clone(), message.correlation_id.clone())
}

impl MasterControlProgram {
    /// 分发请求：target 为具体 Agent ID 时直接使用，否则按请求类型推断 Agent 类型
    pub async fn dispatch_request(
        &self,
        mut request: AgentRequest,
        target: Option<&str>,
    ) -> AgentResponse {
        let correlation_id = request
            .correlation_id()
            .map(str::to_owned)
            .unwrap_or_else(new_correlation_id);
        request.metadata_mut().correlation_id = Some(correlation_id.clone());

        match self.try_dispatch(request, target, &correlation_id).await {
            Ok(response) => response,
            Err(failure) => self.fail_dispatch(failure, Some(correlation_id)).await,
        }
    }

    async fn try_dispatch(
        &self,
        request: AgentRequest,
        target: Option<&str>,
        correlation_id: &str,
    ) -> Result<AgentResponse, DispatchFailure> {
        let agent = self
            .select_agent(&request, target)
            .await
            .map_err(DispatchFailure::before_persist)?;
        self.validate_for(agent.as_ref(), &request)
            .await
            .map_err(DispatchFailure::before_persist)?;

        let message = Message::new(
            MCP_SENDER_ID,
            agent.id(),
            request.request_type.clone(),
            request.payload.clone(),
        )
        .with_priority(request.priority)
        .with_correlation_id(correlation_id);

        self.persist_new_message(&message)
            .await
            .map_err(|e| DispatchFailure::after_insert(e, &message.id))?;
        self.deliver(agent, &message, request).await
    }

    /// 路由一条已寻址的消息：收件人已知，直接把消息映射成请求
    pub async fn route_message(&self, mut message: Message) -> AgentResponse {
        if message.correlation_id.is_none() {
            message.correlation_id = Some(new_correlation_id());
        }
        let correlation_id = message.correlation_id.clone();
        match self.try_route(message).await {
            Ok(response) => response,
            Err(failure) => self.fail_dispatch(failure, correlation_id).await,
        }
    }

    async fn try_route(&self, mut message: Message) -> Result<AgentResponse, DispatchFailure> {
        if message.is_broadcast() {
            return Err(DispatchFailure::before_persist(McpError::InvalidArgument(
                "broadcast messages must go through broadcast_message".to_string(),
            )));
        }
        if message.is_expired(Utc::now()) {
            return Err(DispatchFailure::before_persist(McpError::InvalidArgument(
                format!("message {} expired before delivery", message.id),
            )));
        }

        let agent = self
            .select_agent_by_id(&message.recipient_id)
            .await
            .map_err(DispatchFailure::before_persist)?;
        let request = message.to_request();
        self.validate_for(agent.as_ref(), &request)
            .await
            .map_err(DispatchFailure::before_persist)?;

        message.status = Status::Pending;
        message.updated_at = Utc::now();
        self.persist_new_message(&message)
            .await
            .map_err(|e| DispatchFailure::after_insert(e, &message.id))?;
        self.deliver(agent, &message, request).await
    }

    /// 广播：为每个活跃 Agent 生成一条寻址消息并独立路由；部分失败是正常的
    ///
    /// 传入的消息作为信封记录（收件人 `*`），子消息共享其关联 ID。
    pub async fn broadcast_message(
        &self,
        mut envelope: Message,
    ) -> Result<Vec<(String, AgentResponse)>, McpError> {
        envelope.recipient_id = crate::ledger::BROADCAST_RECIPIENT.to_string();
        envelope.status = Status::Pending;
        let correlation_id = envelope
            .correlation_id
            .get_or_insert_with(new_correlation_id)
            .clone();

        let opened = match self.persist_new_message(&envelope).await {
            Ok(()) => self.set_status(&envelope.id, Status::Processing).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            if !is_duplicate(&e) {
                self.mark_failed(&envelope.id).await;
            }
            tracing::warn!(
                message_id = %envelope.id,
                error = %e,
                "Broadcast envelope could not be opened"
            );
            self.events.emit(
                EventType::ErrorOccurred,
                json!({
                    "message_id": envelope.id,
                    "correlation_id": correlation_id,
                    "error": e.to_info(),
                }),
            );
            return Err(e);
        }

        let agents = self.registry.active().await;
        let deliveries = agents.iter().map(|agent| {
            let mut child = Message::new(
                envelope.sender_id.clone(),
                agent.id(),
                envelope.message_type.clone(),
                envelope.payload.clone(),
            )
            .with_priority(envelope.priority)
            .with_correlation_id(correlation_id.clone());
            child.expires_at = envelope.expires_at;
            let agent_id = agent.id().to_string();
            async move { (agent_id, self.route_message(child).await) }
        });
        let results: Vec<(String, AgentResponse)> = join_all(deliveries).await;

        let delivered = results.iter().filter(|(_, r)| r.success).count();
        match self.set_status(&envelope.id, Status::Completed).await {
            Ok(_) => {}
            Err(e) if is_canceled(&e) => {
                tracing::info!(message_id = %envelope.id, "Broadcast envelope canceled");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            message_id = %envelope.id,
            correlation_id = %correlation_id,
            targets = results.len(),
            delivered,
            "Broadcast finished"
        );
        self.events.emit(
            EventType::MessageProcessed,
            json!({
                "message_id": envelope.id,
                "correlation_id": correlation_id,
                "broadcast": true,
                "targets": results.len(),
                "delivered": delivered,
            }),
        );
        Ok(results)
    }

    /// 取消 PENDING / PROCESSING 的消息，并尽力通知收件 Agent
    pub async fn cancel_message(&self, message_id: &str) -> Result<Message, McpError> {
        let message = self.set_status(message_id, Status::Canceled).await?;
        tracing::info!(message_id, status = %message.status, "Message canceled");

        if !message.is_broadcast() {
            if let Some(agent) = self.registry.get(&message.recipient_id).await {
                match self.guarded(agent.id(), agent.cancel_request(message_id)).await {
                    Ok(stopped) => {
                        tracing::debug!(message_id, agent_id = %agent.id(), stopped, "Cancel notice sent")
                    }
                    Err(e) => {
                        tracing::warn!(message_id, agent_id = %agent.id(), error = %e, "Cancel notice failed")
                    }
                }
            }
        }

        self.events.emit(
            EventType::MessageProcessed,
            json!({
                "message_id": message.id,
                "agent_id": message.recipient_id,
                "status": message.status,
                "correlation_id": message.correlation_id,
            }),
        );
        Ok(message)
    }

    // ---- 内部步骤 ----

    async fn select_agent(
        &self,
        request: &AgentRequest,
        target: Option<&str>,
    ) -> Result<Arc<dyn Agent>, McpError> {
        if let Some(agent_id) = target {
            return self.select_agent_by_id(agent_id).await;
        }
        let agent_type = infer_agent_type(&request.request_type);
        let agent = self
            .registry
            .first_active_of_type(agent_type)
            .await
            .ok_or_else(|| {
                McpError::NoAgentAvailable(format!(
                    "no active {agent_type} agent for request type '{}'",
                    request.request_type
                ))
            })?;
        tracing::debug!(
            request_type = %request.request_type,
            agent_type = %agent_type,
            agent_id = %agent.id(),
            "Agent selected by type"
        );
        Ok(agent)
    }

    async fn select_agent_by_id(&self, agent_id: &str) -> Result<Arc<dyn Agent>, McpError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| McpError::AgentNotFound(agent_id.to_string()))?;
        if !agent.is_active() {
            return Err(McpError::NoAgentAvailable(format!(
                "agent {agent_id} is inactive"
            )));
        }
        Ok(agent)
    }

    /// 分发前校验：匹配到的能力的参数形状 + Agent 自身的 validate_request
    async fn validate_for(&self, agent: &dyn Agent, request: &AgentRequest) -> Result<(), McpError> {
        let mut violations = Vec::new();
        if let Some(capability) = agent
            .capabilities()
            .into_iter()
            .find(|c| c.handles(&request.action))
        {
            if let Err(mut found) = capability.check(request) {
                violations.append(&mut found);
            }
        }
        if violations.is_empty() {
            match self.guarded(agent.id(), agent.validate_request(request)).await {
                Ok(true) => {}
                Ok(false) => violations.push(format!(
                    "agent {} rejected action '{}'",
                    agent.id(),
                    request.action
                )),
                Err(e) => violations.push(e.to_string()),
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            tracing::info!(agent_id = %agent.id(), ?violations, "Request rejected before dispatch");
            Err(McpError::ValidationFailed {
                agent_id: agent.id().to_string(),
                violations,
            })
        }
    }

    async fn persist_new_message(&self, message: &Message) -> Result<(), McpError> {
        self.retry
            .run_insert("insert_message", || self.ledger.insert_message(message))
            .await?;
        tracing::debug!(
            message_id = %message.id,
            agent_id = %message.recipient_id,
            correlation_id = ?message.correlation_id,
            status = %message.status,
            "Message persisted"
        );
        self.events.emit(
            EventType::MessageReceived,
            json!({
                "message_id": message.id,
                "agent_id": message.recipient_id,
                "message_type": message.message_type,
                "correlation_id": message.correlation_id,
            }),
        );
        Ok(())
    }

    async fn set_status(&self, message_id: &str, status: Status) -> Result<Message, McpError> {
        self.retry
            .run("update_message_status", || {
                self.ledger.update_message_status(message_id, status)
            })
            .await
    }

    /// DELIVERED → 终态：调用 Agent，记录经验，写入最终状态
    async fn deliver(
        &self,
        agent: Arc<dyn Agent>,
        message: &Message,
        request: AgentRequest,
    ) -> Result<AgentResponse, DispatchFailure> {
        let initial_state = json!({
            "request": {
                "type": request.request_type,
                "action": request.action,
                "payload": request.payload,
            },
            "agent_id": agent.id(),
            "timestamp": Utc::now(),
        });
        let action = request.action.clone();

        match self.set_status(&message.id, Status::Processing).await {
            Ok(_) => {}
            Err(e) if is_canceled(&e) => return Ok(canceled_response(message)),
            Err(e) => return Err(DispatchFailure::for_message(e, &message.id)),
        }

        let response = self.call_agent(agent.as_ref(), request, &message.id).await;

        // Agent 返回后若消息已被取消，停止后续记账
        let current = self
            .retry
            .run("get_message", || self.ledger.get_message(&message.id))
            .await
            .map_err(|e| DispatchFailure::for_message(e, &message.id))?;
        if current.map(|m| m.status) == Some(Status::Canceled) {
            tracing::info!(message_id = %message.id, agent_id = %agent.id(), "Message canceled during delivery");
            return Ok(canceled_response(message));
        }

        let reward = if response.success {
            self.config.success_reward
        } else {
            self.config.failure_reward
        };
        let next_state = json!({
            "success": response.success,
            "data": response.data,
            "error": response.error,
            "timestamp": Utc::now(),
        });
        let experience = Experience {
            correlation_id: message.correlation_id.clone(),
            initial_state,
            result: serde_json::to_value(&response).unwrap_or_default(),
            next_state,
            metadata: Some(json!({ "message_type": message.message_type })),
            ..Experience::new(agent.id(), message.id.clone(), action, reward)
        };
        let experience_id = self
            .replay
            .record_experience(experience, self.config.base_experience_priority)
            .await
            .map_err(|e| DispatchFailure::for_message(e, &message.id))?;
        self.events.emit(
            EventType::ExperienceRecorded,
            json!({
                "experience_id": experience_id,
                "agent_id": agent.id(),
                "message_id": message.id,
                "reward": reward,
            }),
        );

        let final_status = if response.success {
            Status::Completed
        } else {
            Status::Failed
        };
        match self.set_status(&message.id, final_status).await {
            Ok(_) => {}
            Err(e) if is_canceled(&e) => return Ok(canceled_response(message)),
            Err(e) => return Err(DispatchFailure::for_message(e, &message.id)),
        }

        tracing::info!(
            message_id = %message.id,
            agent_id = %agent.id(),
            correlation_id = ?message.correlation_id,
            status = %final_status,
            "Message processed"
        );
        self.events.emit(
            EventType::MessageProcessed,
            json!({
                "message_id": message.id,
                "agent_id": agent.id(),
                "status": final_status,
                "correlation_id": message.correlation_id,
            }),
        );
        if let Some(error) = &response.error {
            self.events.emit(
                EventType::ErrorOccurred,
                json!({
                    "message_id": message.id,
                    "agent_id": agent.id(),
                    "error": error,
                }),
            );
        }

        Ok(response.with_ids(message.id.clone(), message.correlation_id.clone()))
    }

    /// 调用 handle_request：超时与 panic 都转成失败响应
    async fn call_agent(
        &self,
        agent: &dyn Agent,
        request: AgentRequest,
        message_id: &str,
    ) -> AgentResponse {
        match self.guarded(agent.id(), agent.handle_request(request)).await {
            Ok(response) if !response.success && response.error.is_none() => {
                let mut response = response;
                response.error = Some(ErrorInfo::new(
                    ErrorCode::AgentError,
                    format!("agent {} reported failure", agent.id()),
                ));
                response
            }
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(message_id, agent_id = %agent.id(), error = %e, "Agent call failed");
                if matches!(e, McpError::AgentTimeout { .. }) {
                    let _ = self.guarded(agent.id(), agent.cancel_request(message_id)).await;
                }
                AgentResponse::failure(e.to_info())
            }
        }
    }

    /// 尽力把消息标记为 FAILED（已取消的保持不动）；返回记录是否存在
    async fn mark_failed(&self, message_id: &str) -> bool {
        match self.set_status(message_id, Status::Failed).await {
            Ok(_) => true,
            Err(e) if is_canceled(&e) => true,
            Err(McpError::MessageNotFound(_)) => false,
            Err(e) => {
                tracing::error!(message_id, error = %e, "Failed to mark message FAILED");
                true
            }
        }
    }

    /// 顶层失败处理：消息已存在则标记 FAILED（已取消的保持不动），发出错误事件
    ///
    /// 插入失败时记录也可能已经写入（超时后落库），同样尝试标记。
    async fn fail_dispatch(
        &self,
        failure: DispatchFailure,
        correlation_id: Option<String>,
    ) -> AgentResponse {
        let DispatchFailure { error, mut message_id } = failure;
        let info = error.to_info();

        if let Some(id) = message_id.clone() {
            if !self.mark_failed(&id).await {
                message_id = None;
            }
        }

        tracing::warn!(
            message_id = ?message_id,
            correlation_id = ?correlation_id,
            code = %info.code,
            error = %error,
            "Dispatch failed"
        );
        self.events.emit(
            EventType::ErrorOccurred,
            json!({
                "message_id": message_id,
                "correlation_id": correlation_id,
                "error": info,
            }),
        );

        let mut response = AgentResponse::failure(info);
        response.message_id = message_id;
        response.correlation_id = correlation_id;
        response
    }
}
