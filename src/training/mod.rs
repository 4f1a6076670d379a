//! 训练服务
//!
//! 从回放缓冲抽样 → 过滤 Agent → 聚合每个 action 的平均奖励 → 产出 PolicyUpdate。
//! 这是一个简单的统计汇总，不是学习模型。

pub mod policy;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::TrainingSection;
use crate::core::McpError;
use crate::ledger::Experience;
use crate::replay::ReplayBuffer;

pub use policy::{recommend, ActionPerformance, AgentRecommendation, PolicyUpdate};

/// 抽样策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// 均匀随机
    Random,
    /// 只取高优先级
    Priority,
    /// 一半高优先级 + 一半随机，去重
    Balanced,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Random => "random",
            SamplingStrategy::Priority => "priority",
            SamplingStrategy::Balanced => "balanced",
        }
    }
}

impl FromStr for SamplingStrategy {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(SamplingStrategy::Random),
            "priority" => Ok(SamplingStrategy::Priority),
            "balanced" => Ok(SamplingStrategy::Balanced),
            other => Err(McpError::Config(format!("unknown sampling strategy: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub sampling_strategy: SamplingStrategy,
    pub sample_size: usize,
    /// 预留给后续加权使用
    pub learning_rate: f64,
    /// 设置后只训练名单内的 Agent
    pub allow_agents: Option<HashSet<String>>,
    pub deny_agents: HashSet<String>,
    pub priority_threshold: f64,
    /// 周期训练间隔；None 表示只手动触发
    pub interval: Option<Duration>,
    pub min_experiences: usize,
    pub top_actions: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sampling_strategy: SamplingStrategy::Balanced,
            sample_size: 100,
            learning_rate: 0.1,
            allow_agents: None,
            deny_agents: HashSet::new(),
            priority_threshold: 1.0,
            interval: None,
            min_experiences: 5,
            top_actions: 3,
        }
    }
}

impl TryFrom<&TrainingSection> for TrainingConfig {
    type Error = McpError;

    fn try_from(section: &TrainingSection) -> Result<Self, Self::Error> {
        Ok(Self {
            sampling_strategy: section.sampling_strategy.parse()?,
            sample_size: section.sample_size,
            learning_rate: section.learning_rate,
            allow_agents: section
                .allow_agents
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
            deny_agents: section.deny_agents.iter().cloned().collect(),
            priority_threshold: section.priority_threshold,
            interval: section
                .interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            min_experiences: section.min_experiences,
            top_actions: section.top_actions,
        })
    }
}

impl TrainingConfig {
    fn admits(&self, agent_id: &str) -> bool {
        if self.deny_agents.contains(agent_id) {
            return false;
        }
        self.allow_agents
            .as_ref()
            .map_or(true, |allow| allow.contains(agent_id))
    }
}

pub struct TrainingService {
    replay: Arc<ReplayBuffer>,
    config: TrainingConfig,
}

impl TrainingService {
    pub fn new(replay: Arc<ReplayBuffer>, config: TrainingConfig) -> Self {
        Self { replay, config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    async fn draw_sample(&self) -> Result<Vec<Experience>, McpError> {
        let n = self.config.sample_size;
        let threshold = self.config.priority_threshold;
        match self.config.sampling_strategy {
            SamplingStrategy::Random => self.replay.sample_experiences(n).await,
            SamplingStrategy::Priority => self.replay.high_priority_above(threshold, n).await,
            SamplingStrategy::Balanced => {
                let half = n / 2;
                let mut sample = self.replay.high_priority_above(threshold, half).await?;
                let random = self.replay.sample_experiences(n - half).await?;
                let mut seen: HashSet<String> = sample.iter().map(|e| e.id.clone()).collect();
                sample.extend(random.into_iter().filter(|e| seen.insert(e.id.clone())));
                Ok(sample)
            }
        }
    }

    /// 执行一次训练；没有足够经验的 Agent 时返回 None
    pub async fn train_agents(&self) -> Result<Option<PolicyUpdate>, McpError> {
        let sample: Vec<Experience> = self
            .draw_sample()
            .await?
            .into_iter()
            .filter(|e| self.config.admits(&e.agent_id))
            .collect();

        let recommendations = recommend(
            &sample,
            self.config.min_experiences,
            self.config.top_actions,
        );
        if recommendations.is_empty() {
            tracing::debug!(
                sampled = sample.len(),
                "Training produced no recommendations"
            );
            return Ok(None);
        }

        let update = PolicyUpdate::new(
            recommendations,
            Some(json!({
                "sampling_strategy": self.config.sampling_strategy.as_str(),
                "sample_size": self.config.sample_size,
                "sampled": sample.len(),
                "learning_rate": self.config.learning_rate,
            })),
        );
        tracing::info!(
            update_id = %update.update_id,
            agents = update.agent_ids.len(),
            sampled = sample.len(),
            "Training completed"
        );
        Ok(Some(update))
    }
}
