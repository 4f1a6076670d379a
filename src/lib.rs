//! Hive - Rust 多智能体编排核心
//!
//! 模块划分：
//! - **agent**: Agent 契约、可选能力、注册表与按请求类型的路由表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误码、事件总线、优先级队列、持久化重试策略
//! - **ledger**: 消息 / 任务 / 经验 / 主提示的持久化（内存与 SQLite）
//! - **mcp**: Master Control Program：分发、广播、任务调度、主提示分发
//! - **observability**: tracing 订阅者初始化
//! - **replay**: 经验回放缓冲
//! - **training**: 训练服务与策略更新

pub mod agent;
pub mod config;
pub mod core;
pub mod ledger;
pub mod mcp;
pub mod observability;
pub mod replay;
pub mod training;

pub use agent::{Agent, AgentRequest, AgentResponse, AgentType};
pub use core::{ErrorCode, EventBus, EventType, McpError};
pub use mcp::{MasterControlProgram, McpBuilder};
