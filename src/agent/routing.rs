//! 请求类型 → Agent 类型 的关键字路由表
//!
//! 有序表，第一个命中的条目生效；都不命中时落到 USER_INTERACTION。匹配不区分大小写。

use super::AgentType;

/// (关键字列表, 目标类型)
pub const ROUTING_TABLE: &[(&[&str], AgentType)] = &[
    (&["validation", "quality"], AgentType::DataValidation),
    (
        &["compliance", "legal", "regulation"],
        AgentType::LegalCompliance,
    ),
    (
        &["valuation", "assessment", "appraisal"],
        AgentType::Valuation,
    ),
    (&["tax", "levy"], AgentType::TaxInformation),
    (&["workflow", "process"], AgentType::Workflow),
    (
        &["map", "gis", "spatial", "layer"],
        AgentType::MapIntelligence,
    ),
    (
        &["user", "interaction", "chat"],
        AgentType::UserInteraction,
    ),
];

pub const DEFAULT_AGENT_TYPE: AgentType = AgentType::UserInteraction;

/// 由请求类型推断目标 Agent 类型
pub fn infer_agent_type(request_type: &str) -> AgentType {
    let lower = request_type.to_lowercase();
    ROUTING_TABLE
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, agent_type)| *agent_type)
        .unwrap_or(DEFAULT_AGENT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_matches() {
        assert_eq!(infer_agent_type("data-quality-check"), AgentType::DataValidation);
        assert_eq!(infer_agent_type("Legal-Review"), AgentType::LegalCompliance);
        assert_eq!(infer_agent_type("property_appraisal"), AgentType::Valuation);
        assert_eq!(infer_agent_type("levy-estimate"), AgentType::TaxInformation);
        assert_eq!(infer_agent_type("approval-workflow"), AgentType::Workflow);
        assert_eq!(infer_agent_type("GIS_LAYER_SUGGEST"), AgentType::MapIntelligence);
        assert_eq!(infer_agent_type("chat"), AgentType::UserInteraction);
    }

    #[test]
    fn test_first_match_wins() {
        // "validation" 出现在 "tax" 之前的表项中
        assert_eq!(infer_agent_type("tax-validation"), AgentType::DataValidation);
        assert_eq!(infer_agent_type("compliance-process"), AgentType::LegalCompliance);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        assert_eq!(infer_agent_type("something-else"), DEFAULT_AGENT_TYPE);
        assert_eq!(infer_agent_type(""), DEFAULT_AGENT_TYPE);
    }
}
