//! Agent 契约、注册表与路由
//!
//! 各领域 Agent 的业务逻辑不在本 crate 内，编排器只通过 `Agent` trait 调用它们。

pub mod capability;
pub mod registry;
pub mod routing;
pub mod types;

pub use capability::{
    Agent, AgentCapability, AssistanceProvider, BehaviorUpdater, ParamKind, ParamSpec,
    ParameterShape, PromptReceiver,
};
pub use registry::AgentRegistry;
pub use routing::{infer_agent_type, DEFAULT_AGENT_TYPE, ROUTING_TABLE};
pub use types::{AgentRequest, AgentResponse, AgentType, RequestMetadata};
