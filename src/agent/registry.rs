//! Agent 注册表：按 ID 与类型索引的内存目录
//!
//! 同一 ID 再次注册时覆盖旧实例，但保留原注册顺序，
//! 这样 "同类型中第一个活跃 Agent" 的选择是确定的。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Agent, AgentType};

#[derive(Default)]
struct Entries {
    /// id -> (注册序号, Agent)
    agents: HashMap<String, (u64, Arc<dyn Agent>)>,
    next_seq: u64,
}

impl Entries {
    fn ordered(&self) -> Vec<Arc<dyn Agent>> {
        let mut list: Vec<&(u64, Arc<dyn Agent>)> = self.agents.values().collect();
        list.sort_by_key(|(seq, _)| *seq);
        list.into_iter().map(|(_, agent)| Arc::clone(agent)).collect()
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    entries: RwLock<Entries>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Agent；返回被覆盖的旧实例（如有）
    pub async fn register(&self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        let mut entries = self.entries.write().await;
        let id = agent.id().to_string();
        if let Some((_, slot)) = entries.agents.get_mut(&id) {
            let previous = std::mem::replace(slot, agent);
            tracing::warn!(agent_id = %id, "Agent re-registered, previous instance replaced");
            return Some(previous);
        }
        entries.next_seq += 1;
        let seq = entries.next_seq;
        entries.agents.insert(id, (seq, agent));
        None
    }

    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn Agent>> {
        let mut entries = self.entries.write().await;
        entries.agents.remove(id).map(|(_, agent)| agent)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        let entries = self.entries.read().await;
        entries.agents.get(id).map(|(_, agent)| Arc::clone(agent))
    }

    pub async fn by_type(&self, agent_type: AgentType) -> Vec<Arc<dyn Agent>> {
        let entries = self.entries.read().await;
        entries
            .ordered()
            .into_iter()
            .filter(|agent| agent.agent_type() == agent_type)
            .collect()
    }

    /// 全部 Agent（按注册顺序）
    pub async fn all(&self) -> Vec<Arc<dyn Agent>> {
        self.entries.read().await.ordered()
    }

    pub async fn active(&self) -> Vec<Arc<dyn Agent>> {
        let entries = self.entries.read().await;
        entries
            .ordered()
            .into_iter()
            .filter(|agent| agent.is_active())
            .collect()
    }

    pub async fn first_active_of_type(&self, agent_type: AgentType) -> Option<Arc<dyn Agent>> {
        let entries = self.entries.read().await;
        entries
            .ordered()
            .into_iter()
            .find(|agent| agent.agent_type() == agent_type && agent.is_active())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
