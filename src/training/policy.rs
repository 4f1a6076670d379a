//! 策略建议：按 Agent 聚合每个 action 的平均奖励

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::Experience;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionPerformance {
    pub mean_reward: f64,
    pub count: usize,
}

/// 单个 Agent 的建议：排名靠前的 action + 完整的 action 表现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecommendation {
    pub agent_id: String,
    pub preferred_actions: Vec<String>,
    pub action_performance: BTreeMap<String, ActionPerformance>,
    pub experience_count: usize,
}

/// 一次训练的产出；编排器只分发，不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub update_id: String,
    pub timestamp: DateTime<Utc>,
    pub recommendations: BTreeMap<String, AgentRecommendation>,
    pub agent_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl PolicyUpdate {
    pub fn new(recommendations: BTreeMap<String, AgentRecommendation>, parameters: Option<Value>) -> Self {
        Self {
            update_id: format!("policy_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            agent_ids: recommendations.keys().cloned().collect(),
            recommendations,
            parameters,
        }
    }

    pub fn recommendation_for(&self, agent_id: &str) -> Option<&AgentRecommendation> {
        self.recommendations.get(agent_id)
    }
}

/// 按 Agent 分组，丢弃经验数不足 min_experiences 的 Agent，
/// 对其余 Agent 计算每个 action 的平均奖励并取前 top_actions 个
pub fn recommend(
    experiences: &[Experience],
    min_experiences: usize,
    top_actions: usize,
) -> BTreeMap<String, AgentRecommendation> {
    let mut by_agent: HashMap<&str, Vec<&Experience>> = HashMap::new();
    for experience in experiences {
        by_agent
            .entry(experience.agent_id.as_str())
            .or_default()
            .push(experience);
    }

    by_agent
        .into_iter()
        .filter(|(_, list)| list.len() >= min_experiences)
        .map(|(agent_id, list)| {
            let recommendation = recommend_for_agent(agent_id, &list, top_actions);
            (agent_id.to_string(), recommendation)
        })
        .collect()
}

fn recommend_for_agent(
    agent_id: &str,
    experiences: &[&Experience],
    top_actions: usize,
) -> AgentRecommendation {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for experience in experiences {
        let entry = sums.entry(experience.action.clone()).or_insert((0.0, 0));
        entry.0 += experience.reward;
        entry.1 += 1;
    }

    let action_performance: BTreeMap<String, ActionPerformance> = sums
        .into_iter()
        .map(|(action, (sum, count))| {
            (
                action,
                ActionPerformance {
                    mean_reward: sum / count as f64,
                    count,
                },
            )
        })
        .collect();

    // 平均奖励降序；并列时样本多者优先，再按名称
    let mut ranked: Vec<(&String, &ActionPerformance)> = action_performance.iter().collect();
    ranked.sort_by(|(name_a, a), (name_b, b)| {
        b.mean_reward
            .total_cmp(&a.mean_reward)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| name_a.cmp(name_b))
    });
    let preferred_actions = ranked
        .into_iter()
        .take(top_actions)
        .map(|(name, _)| name.clone())
        .collect();

    AgentRecommendation {
        agent_id: agent_id.to_string(),
        preferred_actions,
        action_performance,
        experience_count: experiences.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(agent: &str, action: &str, reward: f64) -> Experience {
        Experience::new(agent, "msg_1", action, reward)
    }

    #[test]
    fn test_agents_below_minimum_are_dropped() {
        let mut experiences: Vec<Experience> =
            (0..5).map(|_| exp("busy", "check", 1.0)).collect();
        experiences.extend((0..4).map(|_| exp("quiet", "check", 1.0)));

        let recs = recommend(&experiences, 5, 3);
        assert_eq!(recs.len(), 1);
        assert!(recs.contains_key("busy"));
        assert_eq!(recs["busy"].experience_count, 5);
    }

    #[test]
    fn test_actions_ranked_by_mean_reward() {
        let experiences = vec![
            exp("a", "slow", -0.5),
            exp("a", "slow", 1.0),
            exp("a", "fast", 1.0),
            exp("a", "fast", 1.0),
            exp("a", "broken", -0.5),
            exp("a", "okay", 1.0),
            exp("a", "okay", -0.5),
            exp("a", "okay", 1.0),
        ];
        let recs = recommend(&experiences, 5, 3);
        let rec = &recs["a"];
        assert_eq!(rec.preferred_actions, vec!["fast", "okay", "slow"]);
        assert_eq!(rec.action_performance.len(), 4);
        assert_eq!(rec.action_performance["slow"].mean_reward, 0.25);
        assert_eq!(rec.action_performance["broken"].count, 1);
    }

    #[test]
    fn test_policy_update_lists_covered_agents() {
        let experiences: Vec<Experience> = (0..5)
            .flat_map(|_| [exp("x", "a", 1.0), exp("y", "b", -0.5)])
            .collect();
        let update = PolicyUpdate::new(recommend(&experiences, 5, 3), None);
        assert!(update.update_id.starts_with("policy_"));
        assert_eq!(update.agent_ids, vec!["x".to_string(), "y".to_string()]);
        assert!(update.recommendation_for("y").is_some());
    }
}
