//! 核心基础设施：错误码、优先级队列、事件总线、持久化重试策略

pub mod error;
pub mod events;
pub mod priority_queue;
pub mod retry;

pub use error::{ErrorCode, ErrorInfo, McpError};
pub use events::{Event, EventBus, EventHandler, EventType, HandlerId};
pub use priority_queue::PriorityQueue;
pub use retry::RetryPolicy;
