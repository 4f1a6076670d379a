//! MCP 构建器：统一组装台账、回放缓冲、训练服务与 Agent
//!
//! 二进制与测试共用同一条组装路径；未指定台账时使用内存台账。

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::{Background, McpConfig, MasterControlProgram};
use crate::agent::{Agent, AgentRegistry};
use crate::config::AppConfig;
use crate::core::{EventBus, McpError, PriorityQueue, RetryPolicy};
use crate::ledger::{create_ledger, Ledger, MemoryLedger};
use crate::replay::{ReplayBuffer, ReplayConfig};
use crate::training::{TrainingConfig, TrainingService};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub struct McpBuilder {
    config: McpConfig,
    ledger: Option<Arc<dyn Ledger>>,
    retry: RetryPolicy,
    replay_config: ReplayConfig,
    training_config: TrainingConfig,
    agents: Vec<Arc<dyn Agent>>,
    event_capacity: usize,
}

impl Default for McpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl McpBuilder {
    pub fn new() -> Self {
        Self {
            config: McpConfig::default(),
            ledger: None,
            retry: RetryPolicy::default(),
            replay_config: ReplayConfig::default(),
            training_config: TrainingConfig::default(),
            agents: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// 按应用配置设置全部组件；台账后端在这里打开
    pub fn from_app_config(app: &AppConfig) -> Result<Self, McpError> {
        let ledger = create_ledger(&app.ledger)
            .map_err(|e| McpError::from_ledger("open_ledger", e))?;
        Ok(Self::new()
            .with_config(McpConfig::from(&app.mcp))
            .with_ledger(ledger)
            .with_retry_policy(RetryPolicy::from(&app.ledger))
            .with_replay_config(ReplayConfig::from(&app.replay))
            .with_training_config(TrainingConfig::try_from(&app.training)?))
    }

    pub fn with_config(mut self, config: McpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_replay_config(mut self, config: ReplayConfig) -> Self {
        self.replay_config = config;
        self
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = config;
        self
    }

    /// 预注册 Agent（start 时统一初始化）
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub async fn build(self) -> Arc<MasterControlProgram> {
        let ledger: Arc<dyn Ledger> = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(MemoryLedger::new()),
        };
        let replay = Arc::new(ReplayBuffer::new(
            Arc::clone(&ledger),
            self.replay_config,
            self.retry.clone(),
        ));
        let trainer = TrainingService::new(Arc::clone(&replay), self.training_config);

        let mcp = Arc::new(MasterControlProgram {
            config: self.config,
            registry: AgentRegistry::new(),
            queue: Mutex::new(PriorityQueue::new()),
            task_signal: Notify::new(),
            ledger,
            retry: self.retry,
            replay,
            trainer,
            events: EventBus::new(self.event_capacity),
            running: AtomicBool::new(false),
            background: Mutex::new(Background::default()),
        });
        for agent in self.agents {
            mcp.register_agent(agent).await;
        }
        mcp
    }
}
