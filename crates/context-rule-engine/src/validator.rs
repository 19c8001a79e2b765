//! 规则写入校验
//!
//! setRule 在持久化前校验规则结构，并对已解析的条件树预演各阶段的标签提取，
//! 拒绝无法求值的规则，而不是让它在每次匹配时失败。

use crate::condition::{tags, Condition};
use crate::error::{Result, RuleError};
use crate::extractor::extract_by_tag;
use crate::models::Rule;
use crate::operators::ComparisonOperator;
use serde_json::Value;
use std::sync::Arc;

/// 匹配阶段使用的标签
pub const PHASE_TAGS: [&str; 3] = [
    tags::EVENT_CONDITION,
    tags::PROFILE_CONDITION,
    tags::SESSION_CONDITION,
];

/// 规则校验器
pub struct RuleValidator;

impl RuleValidator {
    /// 校验规则结构
    pub fn validate(rule: &Rule) -> Result<()> {
        if rule.metadata.id.is_empty() {
            return Err(RuleError::InvalidRule("规则 ID 不能为空".to_string()));
        }

        if rule.metadata.scope.is_empty() {
            return Err(RuleError::InvalidRule(format!(
                "规则 '{}' 的作用域不能为空",
                rule.metadata.id
            )));
        }

        if rule.raise_event_only_once_for_profile && rule.raise_event_only_once_for_session {
            return Err(RuleError::InvalidRule(format!(
                "规则 '{}' 不能同时要求按档案与按会话去重",
                rule.metadata.id
            )));
        }

        Self::validate_node(&rule.condition, "condition")?;

        for (i, action) in rule.actions.iter().enumerate() {
            if action.action_type_id.is_empty() {
                return Err(RuleError::InvalidRule(format!(
                    "动作 'actions[{}]' 的 actionTypeId 不能为空",
                    i
                )));
            }
        }

        Ok(())
    }

    /// 预演各匹配阶段的标签提取，条件树需已解析
    pub fn validate_extraction(condition: &Arc<Condition>) -> Result<()> {
        for tag in PHASE_TAGS {
            extract_by_tag(condition, tag)?;
        }
        Ok(())
    }

    fn validate_node(node: &Condition, path: &str) -> Result<()> {
        match node {
            Condition::Leaf(leaf) => {
                if leaf.condition_type_id.is_empty() {
                    return Err(RuleError::InvalidCondition(format!(
                        "条件 '{}' 的 conditionTypeId 不能为空",
                        path
                    )));
                }
                Self::validate_comparison(node, path)
            }
            Condition::Composite(composite) => {
                if composite.sub_conditions.is_empty() {
                    return Err(RuleError::InvalidCondition(format!(
                        "组合条件 '{}' 不能为空",
                        path
                    )));
                }

                for (i, child) in composite.sub_conditions.iter().enumerate() {
                    let child_path = format!("{}.subConditions[{}]", path, i);
                    Self::validate_node(child, &child_path)?;
                }
                Ok(())
            }
        }
    }

    /// 校验属性比较参数
    fn validate_comparison(node: &Condition, path: &str) -> Result<()> {
        let Some(leaf) = node.as_leaf() else {
            return Ok(());
        };
        if leaf.parameter("propertyName").is_none() {
            return Ok(());
        }

        let operator = match leaf.parameter("comparisonOperator") {
            None => return Ok(()),
            Some(Value::String(op)) => op.parse::<ComparisonOperator>()?,
            Some(other) => return Err(RuleError::InvalidOperator(other.to_string())),
        };

        let values = leaf.parameter("propertyValues");
        let value = leaf.parameter("propertyValue");

        match operator {
            ComparisonOperator::Between => {
                let len = values.and_then(Value::as_array).map(Vec::len);
                if len != Some(2) {
                    return Err(RuleError::InvalidCondition(format!(
                        "条件 '{}' 的 between 操作符需要 propertyValues: [min, max]",
                        path
                    )));
                }
            }
            op if op.expects_list() => {
                if !values.is_some_and(Value::is_array) {
                    return Err(RuleError::InvalidCondition(format!(
                        "条件 '{}' 的 {} 操作符需要 propertyValues 数组",
                        path, op
                    )));
                }
            }
            ComparisonOperator::MatchesRegex => {
                let pattern = value.and_then(Value::as_str).ok_or_else(|| {
                    RuleError::InvalidCondition(format!(
                        "条件 '{}' 的 matchesRegex 操作符需要字符串值",
                        path
                    ))
                })?;
                // 预验证正则表达式
                regex::Regex::new(pattern).map_err(|e| {
                    RuleError::InvalidCondition(format!(
                        "条件 '{}' 的正则表达式无效: {}",
                        path, e
                    ))
                })?;
            }
            _ => {}
        }

        Ok(())
    }
}
