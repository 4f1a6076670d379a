//! 经验回放缓冲
//!
//! 有界存储 (state, action, result, reward)；每次写入后执行容量检查，
//! 超出上限时按 "优先级最低、时间最早" 淘汰。

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ReplaySection;
use crate::core::{McpError, RetryPolicy};
use crate::ledger::{Experience, Ledger};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub max_experiences: usize,
    pub priority_threshold: f64,
    pub positive_reward_bonus: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self::from(&ReplaySection::default())
    }
}

impl From<&ReplaySection> for ReplayConfig {
    fn from(section: &ReplaySection) -> Self {
        Self {
            max_experiences: section.max_experiences.max(1),
            priority_threshold: section.priority_threshold,
            positive_reward_bonus: section.positive_reward_bonus,
        }
    }
}

pub struct ReplayBuffer {
    ledger: Arc<dyn Ledger>,
    config: ReplayConfig,
    retry: RetryPolicy,
    /// 写入与容量检查作为一个整体串行执行，保证上限不被并发写入突破
    insert_lock: Mutex<()>,
}

impl ReplayBuffer {
    pub fn new(ledger: Arc<dyn Ledger>, config: ReplayConfig, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            config,
            retry,
            insert_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// 记录一条经验，返回其 ID；实际优先级 = base_priority（reward > 0 时加上奖励加成）
    pub async fn record_experience(
        &self,
        mut experience: Experience,
        base_priority: f64,
    ) -> Result<String, McpError> {
        experience.priority = if experience.reward > 0.0 {
            base_priority + self.config.positive_reward_bonus
        } else {
            base_priority
        };

        let _guard = self.insert_lock.lock().await;
        self.retry
            .run_insert("insert_experience", || self.ledger.insert_experience(&experience))
            .await?;
        self.enforce_capacity().await?;

        tracing::debug!(
            experience_id = %experience.id,
            agent_id = %experience.agent_id,
            reward = experience.reward,
            priority = experience.priority,
            "Experience recorded"
        );
        Ok(experience.id)
    }

    async fn enforce_capacity(&self) -> Result<(), McpError> {
        let count = self
            .retry
            .run("count_experiences", || self.ledger.count_experiences())
            .await?;
        if count <= self.config.max_experiences {
            return Ok(());
        }
        let excess = count - self.config.max_experiences;
        let evicted = self
            .retry
            .run("evict_experiences", || self.ledger.evict_experiences(excess))
            .await?;
        tracing::debug!(evicted, max = self.config.max_experiences, "Replay buffer trimmed");
        Ok(())
    }

    /// priority >= 配置阈值，按优先级降序、时间降序
    pub async fn get_high_priority_experiences(
        &self,
        limit: usize,
    ) -> Result<Vec<Experience>, McpError> {
        self.high_priority_above(self.config.priority_threshold, limit)
            .await
    }

    pub async fn high_priority_above(
        &self,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Experience>, McpError> {
        self.retry
            .run("high_priority_experiences", || {
                self.ledger.high_priority_experiences(threshold, limit)
            })
            .await
    }

    /// 均匀随机抽样
    pub async fn sample_experiences(&self, limit: usize) -> Result<Vec<Experience>, McpError> {
        self.retry
            .run("sample_experiences", || self.ledger.sample_experiences(limit))
            .await
    }

    pub async fn get_agent_experiences(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, McpError> {
        self.retry
            .run("agent_experiences", || {
                self.ledger.agent_experiences(agent_id, limit)
            })
            .await
    }

    /// 批量更新优先级，返回实际更新的条数；两个列表长度不一致时报错
    pub async fn update_priorities(
        &self,
        ids: &[String],
        priorities: &[f64],
    ) -> Result<usize, McpError> {
        if ids.len() != priorities.len() {
            return Err(McpError::InvalidArgument(format!(
                "{} ids but {} priorities",
                ids.len(),
                priorities.len()
            )));
        }
        let mut updated = 0;
        for (id, priority) in ids.iter().zip(priorities) {
            let found = self
                .retry
                .run("update_experience_priority", || {
                    self.ledger.update_experience_priority(id, *priority)
                })
                .await?;
            if found {
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub async fn len(&self) -> Result<usize, McpError> {
        self.retry
            .run("count_experiences", || self.ledger.count_experiences())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use crate::ledger::MemoryLedger;
    use std::time::Duration;

    fn buffer(max: usize) -> ReplayBuffer {
        let config = ReplayConfig {
            max_experiences: max,
            priority_threshold: 1.0,
            positive_reward_bonus: 0.5,
        };
        let retry = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(1));
        ReplayBuffer::new(Arc::new(MemoryLedger::new()), config, retry)
    }

    fn failed(agent: &str, action: &str) -> Experience {
        Experience::new(agent, "msg_1", action, -0.5)
    }

    #[tokio::test]
    async fn test_positive_reward_gets_bonus() {
        let buffer = buffer(10);
        let ok = Experience::new("a1", "msg_1", "check", 1.0);
        let id = buffer.record_experience(ok, 1.0).await.unwrap();
        buffer.record_experience(failed("a1", "check"), 1.0).await.unwrap();

        let top = buffer.get_high_priority_experiences(10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, id);
        assert_eq!(top[0].priority, 1.5);
        assert_eq!(top[1].priority, 1.0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_priority_oldest() {
        let buffer = buffer(3);
        for _ in 0..3 {
            buffer.record_experience(failed("a1", "noop"), 1.0).await.unwrap();
        }
        let keep = buffer
            .record_experience(failed("a1", "important"), 5.0)
            .await
            .unwrap();

        assert_eq!(buffer.len().await.unwrap(), 3);
        let survivors = buffer.get_agent_experiences("a1", 10).await.unwrap();
        assert!(survivors.iter().any(|e| e.id == keep));
    }

    #[tokio::test]
    async fn test_update_priorities() {
        let buffer = buffer(10);
        let id = buffer.record_experience(failed("a1", "x"), 0.1).await.unwrap();
        assert!(buffer.high_priority_above(1.0, 10).await.unwrap().is_empty());

        let updated = buffer
            .update_priorities(&[id.clone(), "exp_missing".to_string()], &[3.0, 3.0])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(buffer.high_priority_above(1.0, 10).await.unwrap()[0].id, id);

        let err = buffer.update_priorities(&[id], &[]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_sample_respects_limit() {
        let buffer = buffer(10);
        for _ in 0..6 {
            buffer.record_experience(failed("a2", "y"), 1.0).await.unwrap();
        }
        assert_eq!(buffer.sample_experiences(4).await.unwrap().len(), 4);
    }
}
