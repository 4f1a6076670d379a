//! Master Control Program：编排器
//!
//! 持有注册表、任务队列、台账、回放缓冲、训练服务与事件总线。
//! - dispatch：选 Agent → 落消息 → 调用 → 记录经验 → 终态（见 dispatch.rs）
//! - prompts：主提示的创建 / 更新 / 广播 / 撤销（见 prompts.rs）
//! - tasks：优先级任务调度（见 tasks.rs）
//! - 生命周期：start 启动后台训练循环与任务消费者，shutdown 取消它们

mod builder;
mod dispatch;
mod prompts;
mod tasks;

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentRegistry, AgentRequest, AgentResponse, AgentType};
use crate::config::McpSection;
use crate::core::{EventBus, EventType, McpError, PriorityQueue, RetryPolicy};
use crate::ledger::{Ledger, Priority};
use crate::replay::ReplayBuffer;
use crate::training::{PolicyUpdate, TrainingService};

pub use builder::McpBuilder;
pub use prompts::{MasterPromptPatch, NewMasterPrompt};
pub use tasks::NewTask;

/// 编排器自身作为消息发送方时使用的 ID
pub const MCP_SENDER_ID: &str = "mcp";

const MIN_TASK_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct McpConfig {
    /// Agent 调用超时；None 表示不限时
    pub agent_timeout: Option<Duration>,
    pub base_experience_priority: f64,
    pub success_reward: f64,
    pub failure_reward: f64,
    pub task_worker: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self::from(&McpSection::default())
    }
}

impl From<&McpSection> for McpConfig {
    fn from(section: &McpSection) -> Self {
        Self {
            agent_timeout: section
                .agent_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            base_experience_priority: section.base_experience_priority,
            success_reward: section.success_reward,
            failure_reward: section.failure_reward,
            task_worker: section.task_worker,
        }
    }
}

/// 后台循环：训练定时器与任务消费者
#[derive(Default)]
struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct MasterControlProgram {
    config: McpConfig,
    registry: AgentRegistry,
    queue: Mutex<PriorityQueue<String, Priority>>,
    task_signal: Notify,
    ledger: Arc<dyn Ledger>,
    retry: RetryPolicy,
    replay: Arc<ReplayBuffer>,
    trainer: TrainingService,
    events: EventBus,
    running: AtomicBool,
    background: Mutex<Background>,
}

impl MasterControlProgram {
    pub fn builder() -> McpBuilder {
        McpBuilder::new()
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn replay(&self) -> &Arc<ReplayBuffer> {
        &self.replay
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- 注册表 ----

    /// 注册 Agent；同 ID 覆盖旧实例。运行中注册的 Agent 会立即初始化
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        if self.is_running() && !self.guarded(agent.id(), agent.initialize()).await.unwrap_or(false)
        {
            tracing::warn!(agent_id = %agent.id(), "Agent failed to initialize");
        }
        let agent_id = agent.id().to_string();
        let agent_type = agent.agent_type();
        let replaced = self.registry.register(agent).await.is_some();
        tracing::info!(agent_id = %agent_id, agent_type = %agent_type, replaced, "Agent registered");
        self.events.emit(
            EventType::AgentRegistered,
            json!({ "agent_id": agent_id, "agent_type": agent_type, "replaced": replaced }),
        );
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<(), McpError> {
        let agent = self
            .registry
            .unregister(agent_id)
            .await
            .ok_or_else(|| McpError::AgentNotFound(agent_id.to_string()))?;
        if self.is_running() {
            let _ = self.guarded(agent_id, agent.shutdown()).await;
        }
        tracing::info!(agent_id, "Agent unregistered");
        self.events
            .emit(EventType::AgentUnregistered, json!({ "agent_id": agent_id }));
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.registry.get(agent_id).await
    }

    // ---- 生命周期 ----

    /// 初始化全部 Agent，启动训练循环（如配置了间隔）与任务消费者
    pub async fn start(self: &Arc<Self>) -> Result<(), McpError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("MCP already running");
            return Ok(());
        }

        for agent in self.registry.all().await {
            match self.guarded(agent.id(), agent.initialize()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(agent_id = %agent.id(), "Agent failed to initialize");
                    self.events.emit(
                        EventType::ErrorOccurred,
                        json!({ "agent_id": agent.id(), "error": "initialize returned false" }),
                    );
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id(), error = %e, "Agent initialization error");
                    self.events.emit(
                        EventType::ErrorOccurred,
                        json!({ "agent_id": agent.id(), "error": e.to_info() }),
                    );
                }
            }
        }

        let mut background = self.background.lock().await;
        background.token = CancellationToken::new();

        if let Some(interval) = self.trainer.config().interval {
            let mcp = Arc::clone(self);
            let token = background.token.clone();
            background.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = mcp.train_now().await {
                                tracing::warn!(error = %e, "Periodic training failed");
                            }
                        }
                    }
                }
                tracing::debug!("Training loop stopped");
            }));
            tracing::info!(interval_secs = interval.as_secs(), "Training loop started");
        }

        if self.config.task_worker {
            let mcp = Arc::clone(self);
            let token = background.token.clone();
            background.handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = mcp.task_signal.notified() => {
                            while !token.is_cancelled() {
                                match mcp.process_next_task().await {
                                    Ok(Some(_)) => continue,
                                    Ok(None) => break,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Task processing failed");
                                        // 失败的任务已放回队首，稍等再试
                                        let pause = mcp.retry.delay.max(MIN_TASK_RETRY_PAUSE);
                                        tokio::select! {
                                            _ = token.cancelled() => break,
                                            _ = tokio::time::sleep(pause) => {}
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                tracing::debug!("Task worker stopped");
            }));
            // 启动前已入队的任务
            self.task_signal.notify_one();
        }
        drop(background);

        tracing::info!(agents = self.registry.len().await, "MCP started");
        self.events
            .emit(EventType::SystemStatusChanged, json!({ "status": "running" }));
        Ok(())
    }

    /// 取消后台循环，关闭全部 Agent，清空事件处理器
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handles = {
            let mut background = self.background.lock().await;
            background.token.cancel();
            std::mem::take(&mut background.handles)
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("Background loop did not stop in time, aborting");
                abort.abort();
            }
        }

        for agent in self.registry.all().await {
            if let Err(e) = self.guarded(agent.id(), agent.shutdown()).await {
                tracing::warn!(agent_id = %agent.id(), error = %e, "Agent shutdown error");
            }
        }

        tracing::info!("MCP stopped");
        self.events
            .emit(EventType::SystemStatusChanged, json!({ "status": "stopped" }));
        self.events.clear();
    }

    /// 系统概况：运行状态、Agent 数、待处理任务、经验数、生效中的主提示
    pub async fn system_status(&self) -> Result<Value, McpError> {
        let agents = self.registry.all().await;
        let active = agents.iter().filter(|a| a.is_active()).count();
        let mut by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        for agent in &agents {
            *by_type.entry(agent.agent_type().as_str()).or_default() += 1;
        }
        let experiences = self.replay.len().await?;
        let active_prompts = self.get_active_master_prompts().await?.len();

        Ok(json!({
            "running": self.is_running(),
            "agents": {
                "total": agents.len(),
                "active": active,
                "by_type": by_type,
            },
            "pending_tasks": self.pending_tasks().await,
            "experience_count": experiences,
            "active_prompts": active_prompts,
        }))
    }

    /// 逐个询问 Agent 状态；超时或 panic 的记为 unresponsive
    pub async fn agent_health(&self) -> Value {
        let mut report = serde_json::Map::new();
        for agent in self.registry.all().await {
            let status = match self.guarded(agent.id(), agent.status()).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id(), error = %e, "Agent health check failed");
                    json!("unresponsive")
                }
            };
            report.insert(
                agent.id().to_string(),
                json!({
                    "type": agent.agent_type(),
                    "active": agent.is_active(),
                    "status": status,
                }),
            );
        }
        Value::Object(report)
    }

    /// 把协助请求转给指定类型中第一个具备 AssistanceProvider 能力的活跃 Agent（不含请求方自身）
    pub async fn request_assistance(
        &self,
        requester_id: &str,
        agent_type: AgentType,
        request: AgentRequest,
    ) -> AgentResponse {
        let candidates = self.registry.by_type(agent_type).await;
        let provider = candidates.into_iter().find(|agent| {
            agent.id() != requester_id && agent.is_active() && agent.assistance_provider().is_some()
        });
        let Some(agent) = provider else {
            let err = McpError::NoAgentAvailable(format!(
                "no {agent_type} agent can assist {requester_id}"
            ));
            return AgentResponse::failure(err.to_info());
        };
        let Some(helper) = agent.assistance_provider() else {
            return AgentResponse::failure(
                McpError::Internal("assistance provider disappeared".to_string()).to_info(),
            );
        };

        tracing::info!(requester_id, helper_id = %agent.id(), "Assistance requested");
        match self
            .guarded(agent.id(), helper.provide_assistance(requester_id, &request))
            .await
        {
            Ok(response) => response,
            Err(e) => AgentResponse::failure(e.to_info()),
        }
    }

    // ---- 训练 ----

    /// 立即训练一次；有产出时分发给各 Agent
    pub async fn train_now(&self) -> Result<Option<PolicyUpdate>, McpError> {
        let Some(update) = self.trainer.train_agents().await? else {
            return Ok(None);
        };
        self.events.emit(
            EventType::TrainingCompleted,
            json!({ "update_id": update.update_id, "agent_ids": update.agent_ids }),
        );
        self.apply_policy_update(&update).await;
        Ok(Some(update))
    }

    /// 把建议分发给具备 BehaviorUpdater 能力的 Agent，返回接受更新的 Agent 数
    ///
    /// 超时或 panic 的 Agent 记为未更新，并发出 ERROR_OCCURRED。
    pub async fn apply_policy_update(&self, update: &PolicyUpdate) -> usize {
        let mut applied = 0;
        for agent in self.registry.all().await {
            let Some(recommendation) = update.recommendation_for(agent.id()) else {
                continue;
            };
            let Some(updater) = agent.behavior_updater() else {
                tracing::debug!(agent_id = %agent.id(), "Agent has no behavior updater, skipped");
                continue;
            };
            match self
                .guarded(agent.id(), updater.update_behavior(recommendation))
                .await
            {
                Ok(true) => applied += 1,
                Ok(false) => tracing::warn!(
                    agent_id = %agent.id(),
                    update_id = %update.update_id,
                    "Agent declined policy update"
                ),
                Err(e) => {
                    tracing::warn!(
                        agent_id = %agent.id(),
                        update_id = %update.update_id,
                        error = %e,
                        "Policy update delivery failed"
                    );
                    self.events.emit(
                        EventType::ErrorOccurred,
                        json!({
                            "agent_id": agent.id(),
                            "update_id": update.update_id,
                            "error": e.to_info(),
                        }),
                    );
                }
            }
        }
        tracing::info!(update_id = %update.update_id, applied, "Policy update applied");
        self.events.emit(
            EventType::PolicyUpdated,
            json!({ "update_id": update.update_id, "applied": applied }),
        );
        applied
    }

    // ---- 内部 ----

    /// 对 Agent 的调用统一加上超时与 panic 捕获
    async fn guarded<T, F>(&self, agent_id: &str, call: F) -> Result<T, McpError>
    where
        F: Future<Output = T>,
    {
        let call = AssertUnwindSafe(call).catch_unwind();
        let outcome = match self.config.agent_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(McpError::AgentTimeout {
                        agent_id: agent_id.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => call.await,
        };
        outcome.map_err(|panic| {
            McpError::AgentCall(format!("agent {agent_id} panicked: {}", panic_message(panic.as_ref())))
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
