//! 按标签提取条件子树
//!
//! 一条规则只有一棵条件树，其中混合了事件、档案、会话等不同阶段的约束。
//! 提取器把它机械地拆成各阶段的谓词：
//!
//! - 叶子：已解析类型带有该标签则返回自身，否则为 None
//! - 组合：子节点全部命中时返回原节点（同一个 `Arc`）；`and` 下部分命中时
//!   构造新的 `and` 组合（只剩一个子节点时直接返回该子节点）；
//!   其它操作符下部分命中无法保持原有真值语义，返回 [`RuleError::AmbiguousExtraction`]

use crate::condition::{Condition, CompositeCondition};
use crate::error::{Result, RuleError};
use crate::operators::LogicalOperator;
use std::collections::BTreeSet;
use std::sync::Arc;

/// 提取带有指定标签的子树
pub fn extract_by_tag(node: &Arc<Condition>, tag: &str) -> Result<Option<Arc<Condition>>> {
    match node.as_ref() {
        Condition::Leaf(leaf) => Ok(leaf.has_tag(tag).then(|| Arc::clone(node))),
        Condition::Composite(composite) => extract_from_composite(node, composite, tag),
    }
}

fn extract_from_composite(
    node: &Arc<Condition>,
    composite: &CompositeCondition,
    tag: &str,
) -> Result<Option<Arc<Condition>>> {
    let mut matched = Vec::with_capacity(composite.sub_conditions.len());
    let mut unchanged = true;

    for child in &composite.sub_conditions {
        match extract_by_tag(child, tag)? {
            Some(extracted) => {
                unchanged &= Arc::ptr_eq(&extracted, child);
                matched.push(extracted);
            }
            None => unchanged = false,
        }
    }

    if matched.is_empty() {
        return Ok(None);
    }

    if unchanged {
        return Ok(Some(Arc::clone(node)));
    }

    match composite.operator {
        LogicalOperator::And => {
            if matched.len() == 1 {
                Ok(matched.pop())
            } else {
                Ok(Some(Arc::new(Condition::composite(
                    LogicalOperator::And,
                    matched,
                ))))
            }
        }
        operator => Err(RuleError::AmbiguousExtraction {
            tag: tag.to_string(),
            operator: operator.to_string(),
        }),
    }
}

/// 收集所有类型 id 等于 `type_id` 的叶子
///
/// 无论组合操作符为何都会穿透展开，结果按首次出现顺序去重。
pub fn extract_all_by_type(node: &Arc<Condition>, type_id: &str) -> Vec<Arc<Condition>> {
    let mut found: Vec<Arc<Condition>> = Vec::new();
    collect_by_type(node, type_id, &mut found);
    found
}

fn collect_by_type(node: &Arc<Condition>, type_id: &str, found: &mut Vec<Arc<Condition>>) {
    match node.as_ref() {
        Condition::Leaf(leaf) => {
            if leaf.condition_type_id == type_id && !found.iter().any(|c| c == node) {
                found.push(Arc::clone(node));
            }
        }
        Condition::Composite(composite) => {
            for child in &composite.sub_conditions {
                collect_by_type(child, type_id, found);
            }
        }
    }
}

/// 树中所有叶子引用的条件类型 id
///
/// 组合节点自身的类型 id 不由插件提供，不计入。
pub fn condition_type_ids(node: &Condition) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_type_ids(node, &mut ids);
    ids
}

fn collect_type_ids(node: &Condition, ids: &mut BTreeSet<String>) {
    match node {
        Condition::Leaf(leaf) => {
            if !ids.contains(&leaf.condition_type_id) {
                ids.insert(leaf.condition_type_id.clone());
            }
        }
        Condition::Composite(composite) => {
            for child in &composite.sub_conditions {
                collect_type_ids(child, ids);
            }
        }
    }
}
