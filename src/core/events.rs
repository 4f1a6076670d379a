//! 事件总线：编排器对外的事件面
//!
//! 每个 MasterControlProgram 实例持有自己的 EventBus（不是进程级单例）。
//! - 按主题注册同步处理器；某个处理器出错或 panic 只记录日志，不影响其余处理器
//! - subscribe_all 返回 broadcast 接收端，供异步观察者消费全部事件

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// 事件主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentRegistered,
    AgentUnregistered,
    MessageReceived,
    MessageProcessed,
    SystemStatusChanged,
    ExperienceRecorded,
    TrainingCompleted,
    PolicyUpdated,
    MasterPromptUpdated,
    DirectiveBroadcast,
    ErrorOccurred,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "AGENT_REGISTERED",
            EventType::AgentUnregistered => "AGENT_UNREGISTERED",
            EventType::MessageReceived => "MESSAGE_RECEIVED",
            EventType::MessageProcessed => "MESSAGE_PROCESSED",
            EventType::SystemStatusChanged => "SYSTEM_STATUS_CHANGED",
            EventType::ExperienceRecorded => "EXPERIENCE_RECORDED",
            EventType::TrainingCompleted => "TRAINING_COMPLETED",
            EventType::PolicyUpdated => "POLICY_UPDATED",
            EventType::MasterPromptUpdated => "MASTER_PROMPT_UPDATED",
            EventType::DirectiveBroadcast => "DIRECTIVE_BROADCAST",
            EventType::ErrorOccurred => "ERROR_OCCURRED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次事件：主题 + 任意负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// 同步事件处理器
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// 处理器句柄，用于注销
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tx,
        }
    }

    /// 注册某主题的处理器
    pub fn on<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// 注销处理器；不存在时返回 false
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// 订阅全部事件（异步观察者）
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// 发布事件，返回成功执行的处理器数
    pub fn emit(&self, event_type: EventType, payload: Value) -> usize {
        let event = Event {
            event_type,
            payload,
            timestamp: Utc::now(),
        };

        // 先拷贝处理器列表再调用，避免处理器内再次注册时死锁
        let handlers: Vec<(HandlerId, EventHandler)> = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            guard.get(&event_type).cloned().unwrap_or_default()
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(event = %event_type, handler = id.0, error = %e, "Event handler failed");
                }
                Err(_) => {
                    tracing::error!(event = %event_type, handler = id.0, "Event handler panicked");
                }
            }
        }

        let _ = self.tx.send(event);
        delivered
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&event_type).map(Vec::len).unwrap_or(0)
    }

    /// 清空全部处理器（关闭时调用）
    pub fn clear(&self) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_receive_only_their_topic() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.on(EventType::AgentRegistered, move |event| {
            assert_eq!(event.payload["agent_id"], "a1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(EventType::AgentRegistered, json!({ "agent_id": "a1" }));
        bus.emit(EventType::AgentUnregistered, json!({ "agent_id": "a1" }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(EventType::ErrorOccurred, |_| anyhow::bail!("boom"));
        bus.on(EventType::ErrorOccurred, |_| panic!("handler panic"));
        let counter = Arc::clone(&hits);
        bus.on(EventType::ErrorOccurred, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivered = bus.emit(EventType::ErrorOccurred, json!({}));
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let bus = EventBus::default();
        let id = bus.on(EventType::PolicyUpdated, |_| Ok(()));
        assert_eq!(bus.handler_count(EventType::PolicyUpdated), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.handler_count(EventType::PolicyUpdated), 0);
    }

    #[tokio::test]
    async fn test_subscribe_all_sees_every_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_all();
        bus.emit(EventType::TrainingCompleted, json!({ "agents": 2 }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::TrainingCompleted);
        assert_eq!(event.payload["agents"], 2);
    }
}
