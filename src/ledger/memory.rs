//! 进程内台账：tokio RwLock 保护的若干张表

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use super::{
    check_task_update, check_transition, Experience, Ledger, LedgerError, MasterPrompt, Message,
    MessageQuery, PromptAcknowledgment, RecordKind, Status, Task,
};

#[derive(Default)]
struct Tables {
    /// id -> (插入序号, 记录)
    messages: HashMap<String, (u64, Message)>,
    tasks: HashMap<String, (u64, Task)>,
    /// 插入序号 -> 经验；序号用于同优先级同时间时的淘汰次序
    experiences: BTreeMap<u64, Experience>,
    experience_seq: HashMap<String, u64>,
    prompts: HashMap<String, (u64, MasterPrompt)>,
    acknowledgments: HashMap<(String, String), (u64, PromptAcknowledgment)>,
    next_seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn priority_desc_then_recent(a: &Experience, b: &Experience) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}

fn sample_from(experiences: &BTreeMap<u64, Experience>, limit: usize) -> Vec<Experience> {
    let all: Vec<&Experience> = experiences.values().collect();
    let mut rng = rand::thread_rng();
    all.choose_multiple(&mut rng, limit)
        .map(|e| (*e).clone())
        .collect()
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_message(&self, message: &Message) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        if tables.messages.contains_key(&message.id) {
            return Err(LedgerError::Duplicate {
                kind: RecordKind::Message,
                id: message.id.clone(),
            });
        }
        let seq = tables.next_seq();
        tables
            .messages
            .insert(message.id.clone(), (seq, message.clone()));
        Ok(())
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: Status,
    ) -> Result<Message, LedgerError> {
        let mut tables = self.tables.write().await;
        let (_, message) = tables
            .messages
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound {
                kind: RecordKind::Message,
                id: id.to_string(),
            })?;
        check_transition(id, message.status, status)?;
        message.status = status;
        message.updated_at = chrono::Utc::now();
        Ok(message.clone())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.messages.get(id).map(|(_, m)| m.clone()))
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, LedgerError> {
        let tables = self.tables.read().await;
        let mut found: Vec<&(u64, Message)> = tables
            .messages
            .values()
            .filter(|(_, m)| query.matches(m))
            .collect();
        found.sort_by(|(sa, a), (sb, b)| a.created_at.cmp(&b.created_at).then(sa.cmp(sb)));
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(found.into_iter().take(limit).map(|(_, m)| m.clone()).collect())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(LedgerError::Duplicate {
                kind: RecordKind::Task,
                id: task.id.clone(),
            });
        }
        let seq = tables.next_seq();
        tables.tasks.insert(task.id.clone(), (seq, task.clone()));
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let (_, stored) = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| LedgerError::NotFound {
                kind: RecordKind::Task,
                id: task.id.clone(),
            })?;
        check_task_update(&task.id, stored.status, task.status)?;
        *stored = task.clone();
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.get(id).map(|(_, t)| t.clone()))
    }

    async fn list_tasks(&self, status: Option<Status>) -> Result<Vec<Task>, LedgerError> {
        let tables = self.tables.read().await;
        let mut found: Vec<&(u64, Task)> = tables
            .tasks
            .values()
            .filter(|(_, t)| status.map_or(true, |s| t.status == s))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, t)| t.clone()).collect())
    }

    async fn insert_experience(&self, experience: &Experience) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        if tables.experience_seq.contains_key(&experience.id) {
            return Err(LedgerError::Duplicate {
                kind: RecordKind::Experience,
                id: experience.id.clone(),
            });
        }
        let seq = tables.next_seq();
        tables.experience_seq.insert(experience.id.clone(), seq);
        tables.experiences.insert(seq, experience.clone());
        Ok(())
    }

    async fn get_experience(&self, id: &str) -> Result<Option<Experience>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .experience_seq
            .get(id)
            .and_then(|seq| tables.experiences.get(seq))
            .cloned())
    }

    async fn count_experiences(&self) -> Result<usize, LedgerError> {
        Ok(self.tables.read().await.experiences.len())
    }

    async fn evict_experiences(&self, n: usize) -> Result<usize, LedgerError> {
        if n == 0 {
            return Ok(0);
        }
        let mut tables = self.tables.write().await;
        let mut order: Vec<(u64, f64, chrono::DateTime<chrono::Utc>)> = tables
            .experiences
            .iter()
            .map(|(seq, e)| (*seq, e.priority, e.timestamp))
            .collect();
        order.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut evicted = 0;
        for (seq, _, _) in order.into_iter().take(n) {
            if let Some(experience) = tables.experiences.remove(&seq) {
                tables.experience_seq.remove(&experience.id);
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    async fn high_priority_experiences(
        &self,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError> {
        let tables = self.tables.read().await;
        let mut found: Vec<Experience> = tables
            .experiences
            .values()
            .filter(|e| e.priority >= threshold)
            .cloned()
            .collect();
        found.sort_by(priority_desc_then_recent);
        found.truncate(limit);
        Ok(found)
    }

    async fn sample_experiences(&self, limit: usize) -> Result<Vec<Experience>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(sample_from(&tables.experiences, limit))
    }

    async fn agent_experiences(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, LedgerError> {
        let tables = self.tables.read().await;
        // 序号倒序即插入时间倒序
        let mut found: Vec<Experience> = tables
            .experiences
            .values()
            .rev()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(limit);
        Ok(found)
    }

    async fn update_experience_priority(
        &self,
        id: &str,
        priority: f64,
    ) -> Result<bool, LedgerError> {
        let mut tables = self.tables.write().await;
        let Some(seq) = tables.experience_seq.get(id).copied() else {
            return Ok(false);
        };
        match tables.experiences.get_mut(&seq) {
            Some(experience) => {
                experience.priority = priority;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        if tables.prompts.contains_key(&prompt.id) {
            return Err(LedgerError::Duplicate {
                kind: RecordKind::Prompt,
                id: prompt.id.clone(),
            });
        }
        let seq = tables.next_seq();
        tables.prompts.insert(prompt.id.clone(), (seq, prompt.clone()));
        Ok(())
    }

    async fn update_prompt(&self, prompt: &MasterPrompt) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        match tables.prompts.get_mut(&prompt.id) {
            Some((_, stored)) => {
                *stored = prompt.clone();
                Ok(())
            }
            None => Err(LedgerError::NotFound {
                kind: RecordKind::Prompt,
                id: prompt.id.clone(),
            }),
        }
    }

    async fn get_prompt(&self, id: &str) -> Result<Option<MasterPrompt>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.prompts.get(id).map(|(_, p)| p.clone()))
    }

    async fn list_prompts(&self, active_only: bool) -> Result<Vec<MasterPrompt>, LedgerError> {
        let tables = self.tables.read().await;
        let mut found: Vec<&(u64, MasterPrompt)> = tables
            .prompts
            .values()
            .filter(|(_, p)| !active_only || p.is_active)
            .collect();
        found.sort_by(|(sa, a), (sb, b)| a.created_at.cmp(&b.created_at).then(sa.cmp(sb)));
        Ok(found.into_iter().map(|(_, p)| p.clone()).collect())
    }

    async fn upsert_acknowledgment(&self, ack: &PromptAcknowledgment) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let key = (ack.prompt_id.clone(), ack.agent_id.clone());
        let seq = match tables.acknowledgments.get(&key) {
            Some((seq, _)) => *seq,
            None => tables.next_seq(),
        };
        tables.acknowledgments.insert(key, (seq, ack.clone()));
        Ok(())
    }

    async fn list_acknowledgments(
        &self,
        prompt_id: &str,
    ) -> Result<Vec<PromptAcknowledgment>, LedgerError> {
        let tables = self.tables.read().await;
        let mut found: Vec<&(u64, PromptAcknowledgment)> = tables
            .acknowledgments
            .values()
            .filter(|(_, a)| a.prompt_id == prompt_id)
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, a)| a.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AckStatus, Payload};
    use chrono::{Duration, Utc};

    fn experience(agent: &str, priority: f64) -> Experience {
        let mut e = Experience::new(agent, "msg_1", "check", 1.0);
        e.priority = priority;
        e
    }

    #[tokio::test]
    async fn test_message_status_is_monotonic() {
        let ledger = MemoryLedger::new();
        let message = Message::new("mcp", "a1", "ping", Payload::new());
        ledger.insert_message(&message).await.unwrap();

        let updated = ledger
            .update_message_status(&message.id, Status::Processing)
            .await
            .unwrap();
        assert_eq!(updated.status, Status::Processing);
        ledger
            .update_message_status(&message.id, Status::Completed)
            .await
            .unwrap();

        let err = ledger
            .update_message_status(&message.id, Status::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        let stored = ledger.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Completed);
    }

    #[tokio::test]
    async fn test_update_unknown_message_is_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .update_message_status("msg_missing", Status::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotFound {
                kind: RecordKind::Message,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_messages_by_recipient() {
        let ledger = MemoryLedger::new();
        for recipient in ["a1", "a2", "a1"] {
            let message = Message::new("mcp", recipient, "ping", Payload::new());
            ledger.insert_message(&message).await.unwrap();
        }
        let query = MessageQuery {
            recipient_id: Some("a1".to_string()),
            ..Default::default()
        };
        assert_eq!(ledger.list_messages(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_evict_lowest_priority_oldest_first() {
        let ledger = MemoryLedger::new();
        let now = Utc::now();
        let mut old_low = experience("a1", 1.0);
        old_low.timestamp = now - Duration::seconds(10);
        let mut new_low = experience("a1", 1.0);
        new_low.timestamp = now;
        let high = experience("a1", 5.0);

        for e in [&new_low, &old_low, &high] {
            ledger.insert_experience(e).await.unwrap();
        }
        assert_eq!(ledger.evict_experiences(1).await.unwrap(), 1);
        assert!(ledger.get_experience(&old_low.id).await.unwrap().is_none());
        assert!(ledger.get_experience(&new_low.id).await.unwrap().is_some());
        assert_eq!(ledger.count_experiences().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_high_priority_filter_and_order() {
        let ledger = MemoryLedger::new();
        for p in [0.5, 1.5, 3.0, 1.0] {
            ledger.insert_experience(&experience("a1", p)).await.unwrap();
        }
        let found = ledger.high_priority_experiences(1.0, 10).await.unwrap();
        let priorities: Vec<f64> = found.iter().map(|e| e.priority).collect();
        assert_eq!(priorities, vec![3.0, 1.5, 1.0]);
    }

    #[tokio::test]
    async fn test_sample_is_bounded_and_distinct() {
        let ledger = MemoryLedger::new();
        for _ in 0..10 {
            ledger.insert_experience(&experience("a1", 1.0)).await.unwrap();
        }
        let sample = ledger.sample_experiences(4).await.unwrap();
        assert_eq!(sample.len(), 4);
        let mut ids: Vec<_> = sample.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(ledger.sample_experiences(50).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_update_experience_priority() {
        let ledger = MemoryLedger::new();
        let e = experience("a1", 1.0);
        ledger.insert_experience(&e).await.unwrap();
        assert!(ledger.update_experience_priority(&e.id, 4.0).await.unwrap());
        assert!(!ledger.update_experience_priority("exp_missing", 4.0).await.unwrap());
        let stored = ledger.get_experience(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, 4.0);
    }

    #[tokio::test]
    async fn test_acknowledgment_upsert_dedupes() {
        let ledger = MemoryLedger::new();
        let mut ack = PromptAcknowledgment {
            prompt_id: "prompt_1".to_string(),
            agent_id: "a1".to_string(),
            acknowledged_at: Utc::now(),
            status: AckStatus::Received,
            metadata: None,
        };
        ledger.upsert_acknowledgment(&ack).await.unwrap();
        ack.status = AckStatus::Confirmed;
        ledger.upsert_acknowledgment(&ack).await.unwrap();

        let rows = ledger.list_acknowledgments("prompt_1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AckStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_task_terminal_status_cannot_be_rewritten() {
        let ledger = MemoryLedger::new();
        let mut task = Task::new("valuation", "appraise", Payload::new());
        ledger.insert_task(&task).await.unwrap();
        task.status = Status::Canceled;
        ledger.update_task(&task).await.unwrap();
        task.status = Status::Processing;
        assert!(ledger.update_task(&task).await.is_err());
    }
}
