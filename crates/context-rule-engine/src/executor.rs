//! 条件树执行器
//!
//! 对求值上下文做短路求值，供内存持久化层的 `testMatch` 使用。
//!
//! 叶子条件的求值约定：
//! - 未解析的叶子（插件缺失）恒为 false
//! - 带 `propertyName` 的叶子按 `comparisonOperator`（默认 equals）比较
//!   `propertyValue` 或 `propertyValues`
//! - 带 `eventTypeId` 的叶子比较事件类型
//! - `matchAllCondition` 恒为 true

use crate::condition::{CompositeCondition, Condition, LeafCondition};
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::operators::{ComparisonOperator, LogicalOperator};
use crate::subject::EvaluationContext;
use serde_json::Value;

/// 恒为真的条件类型
pub const MATCH_ALL_CONDITION_TYPE: &str = "matchAllCondition";

/// 条件树执行器
#[derive(Debug, Default)]
pub struct ConditionExecutor {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

/// 带追踪信息的评估结果
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub matched: bool,
    pub trace: Vec<String>,
}

impl ConditionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 评估条件树
    pub fn matches(&self, condition: &Condition, context: &EvaluationContext) -> Result<bool> {
        let mut trace = Vec::new();
        self.evaluate_node(condition, context, &mut trace, "root")
    }

    /// 评估条件树并返回追踪信息
    pub fn evaluate(
        &self,
        condition: &Condition,
        context: &EvaluationContext,
    ) -> Result<Evaluation> {
        let mut trace = Vec::new();
        let matched = self.evaluate_node(condition, context, &mut trace, "root")?;
        Ok(Evaluation { matched, trace })
    }

    fn evaluate_node(
        &self,
        node: &Condition,
        context: &EvaluationContext,
        trace: &mut Vec<String>,
        path: &str,
    ) -> Result<bool> {
        match node {
            Condition::Leaf(leaf) => self.evaluate_leaf(leaf, context, trace, path),
            Condition::Composite(composite) => {
                self.evaluate_composite(composite, context, trace, path)
            }
        }
    }

    fn evaluate_leaf(
        &self,
        leaf: &LeafCondition,
        context: &EvaluationContext,
        trace: &mut Vec<String>,
        path: &str,
    ) -> Result<bool> {
        let matched = if !leaf.is_resolved() {
            false
        } else if leaf.condition_type_id == MATCH_ALL_CONDITION_TYPE {
            true
        } else if let Some(name) = leaf.parameter("propertyName") {
            let name = name.as_str().ok_or_else(|| {
                RuleError::InvalidCondition(format!("{}: propertyName 必须是字符串", path))
            })?;
            Self::evaluate_property(leaf, name, context)?
        } else if let Some(event_type) = leaf.parameter("eventTypeId") {
            ConditionEvaluator::evaluate(
                context.get_field("eventType"),
                ComparisonOperator::Equals,
                event_type,
            )?
        } else {
            return Err(RuleError::InvalidCondition(format!(
                "{}: 条件 {} 缺少 propertyName",
                path, leaf.condition_type_id
            )));
        };

        if self.trace_enabled {
            trace.push(format!(
                "{}: {} => {}",
                path,
                leaf.condition_type_id,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            ));
        }

        Ok(matched)
    }

    fn evaluate_property(
        leaf: &LeafCondition,
        name: &str,
        context: &EvaluationContext,
    ) -> Result<bool> {
        let operator = match leaf.parameter("comparisonOperator") {
            None => ComparisonOperator::Equals,
            Some(Value::String(op)) => op.parse()?,
            Some(other) => return Err(RuleError::InvalidOperator(other.to_string())),
        };

        let expected = if operator.expects_list() {
            leaf.parameter("propertyValues")
                .or_else(|| leaf.parameter("propertyValue"))
        } else {
            leaf.parameter("propertyValue")
                .or_else(|| leaf.parameter("propertyValues"))
        }
        .unwrap_or(&Value::Null);

        ConditionEvaluator::evaluate(context.get_field(name), operator, expected)
    }

    /// 评估组合节点（短路求值）
    fn evaluate_composite(
        &self,
        composite: &CompositeCondition,
        context: &EvaluationContext,
        trace: &mut Vec<String>,
        path: &str,
    ) -> Result<bool> {
        if self.trace_enabled {
            trace.push(format!(
                "{}: 开始评估 {} 组 (共 {} 个子节点)",
                path,
                composite.operator,
                composite.sub_conditions.len()
            ));
        }

        let short_circuit_on = match composite.operator {
            LogicalOperator::And => false,
            LogicalOperator::Or => true,
        };

        for (i, child) in composite.sub_conditions.iter().enumerate() {
            let child_path = format!("{}.subConditions[{}]", path, i);
            let child_matched = self.evaluate_node(child, context, trace, &child_path)?;

            if child_matched == short_circuit_on {
                if self.trace_enabled {
                    trace.push(format!(
                        "{}: {} 短路 - 子节点 {}",
                        path, composite.operator, i
                    ));
                }
                return Ok(short_circuit_on);
            }
        }

        Ok(!short_circuit_on)
    }
}
