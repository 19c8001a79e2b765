//! 条件树模型
//!
//! 条件节点要么是叶子（引用一个条件类型并携带参数），要么是组合节点
//! （携带 `subConditions` 与 `operator` 参数）。子节点以 `Arc` 共享，
//! 重写算法可以直接返回原节点，调用方用 `Arc::ptr_eq` 判断是否被改写。
//!
//! 序列化格式与规则定义文件一致：
//!
//! ```json
//! {
//!   "conditionTypeId": "booleanCondition",
//!   "parameterValues": {
//!     "operator": "and",
//!     "subConditions": [
//!       { "conditionTypeId": "eventTypeCondition", "parameterValues": { "eventTypeId": "view" } }
//!     ]
//!   }
//! }
//! ```

use crate::error::RuleError;
use crate::operators::LogicalOperator;
use crate::registry::{ConditionType, Resolution, TypeRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// 条件类型上的语义标签
pub mod tags {
    pub const EVENT_CONDITION: &str = "eventCondition";
    pub const PROFILE_CONDITION: &str = "profileCondition";
    pub const SESSION_CONDITION: &str = "sessionCondition";
    pub const TRACKED_CONDITION: &str = "trackedCondition";
}

/// 为被追踪条件提供来源事件约束的叶子条件类型
pub const SOURCE_EVENT_PROPERTY_CONDITION_TYPE: &str = "sourceEventPropertyCondition";

/// 组合条件默认的类型 id
pub const BOOLEAN_CONDITION_TYPE: &str = "booleanCondition";

/// 条件节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    Leaf(LeafCondition),
    Composite(CompositeCondition),
}

/// 叶子条件
#[derive(Debug, Clone)]
pub struct LeafCondition {
    pub condition_type_id: String,
    pub parameter_values: Map<String, Value>,
    condition_type: Resolution<ConditionType>,
}

impl LeafCondition {
    pub fn new(condition_type_id: impl Into<String>, parameter_values: Map<String, Value>) -> Self {
        Self {
            condition_type_id: condition_type_id.into(),
            parameter_values,
            condition_type: Resolution::Unresolved,
        }
    }

    /// 已解析的条件类型，插件不可用时为 None
    pub fn condition_type(&self) -> Option<&ConditionType> {
        self.condition_type.get()
    }

    pub fn resolution(&self) -> &Resolution<ConditionType> {
        &self.condition_type
    }

    pub fn is_resolved(&self) -> bool {
        self.condition_type.is_resolved()
    }

    /// 未解析的叶子不携带任何标签
    pub fn has_tag(&self, tag: &str) -> bool {
        self.condition_type().is_some_and(|ty| ty.has_tag(tag))
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameter_values.get(name)
    }
}

// 解析结果只是附加元数据，不参与相等性判断
impl PartialEq for LeafCondition {
    fn eq(&self, other: &Self) -> bool {
        self.condition_type_id == other.condition_type_id
            && self.parameter_values == other.parameter_values
    }
}

/// 组合条件
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeCondition {
    pub condition_type_id: String,
    pub operator: LogicalOperator,
    pub sub_conditions: Vec<Arc<Condition>>,
}

impl CompositeCondition {
    pub fn new(operator: LogicalOperator, sub_conditions: Vec<Arc<Condition>>) -> Self {
        Self {
            condition_type_id: BOOLEAN_CONDITION_TYPE.to_string(),
            operator,
            sub_conditions,
        }
    }
}

impl Condition {
    pub fn leaf(condition_type_id: impl Into<String>, parameter_values: Map<String, Value>) -> Self {
        Self::Leaf(LeafCondition::new(condition_type_id, parameter_values))
    }

    pub fn composite(operator: LogicalOperator, sub_conditions: Vec<Arc<Condition>>) -> Self {
        Self::Composite(CompositeCondition::new(operator, sub_conditions))
    }

    pub fn and(sub_conditions: Vec<Condition>) -> Self {
        Self::composite(
            LogicalOperator::And,
            sub_conditions.into_iter().map(Arc::new).collect(),
        )
    }

    pub fn or(sub_conditions: Vec<Condition>) -> Self {
        Self::composite(
            LogicalOperator::Or,
            sub_conditions.into_iter().map(Arc::new).collect(),
        )
    }

    pub fn condition_type_id(&self) -> &str {
        match self {
            Self::Leaf(leaf) => &leaf.condition_type_id,
            Self::Composite(composite) => &composite.condition_type_id,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafCondition> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Composite(_) => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    /// 树中所有叶子是否都已解析
    pub fn is_fully_resolved(&self) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.is_resolved(),
            Self::Composite(composite) => composite
                .sub_conditions
                .iter()
                .all(|child| child.is_fully_resolved()),
        }
    }
}

/// 解析条件树中的类型引用
///
/// 幂等且可在每次匹配时调用：没有任何叶子的解析结果发生变化时返回原节点本身，
/// 否则只重建发生变化的路径。无法解析的叶子保持 `Unresolved`，不会报错。
pub fn resolve(node: &Arc<Condition>, registry: &dyn TypeRegistry) -> Arc<Condition> {
    match node.as_ref() {
        Condition::Leaf(leaf) => {
            let resolution = registry.condition_type(&leaf.condition_type_id);
            if resolution.same_as(&leaf.condition_type) {
                Arc::clone(node)
            } else {
                Arc::new(Condition::Leaf(LeafCondition {
                    condition_type_id: leaf.condition_type_id.clone(),
                    parameter_values: leaf.parameter_values.clone(),
                    condition_type: resolution,
                }))
            }
        }
        Condition::Composite(composite) => {
            let mut rebuilt: Option<Vec<Arc<Condition>>> = None;

            for (i, child) in composite.sub_conditions.iter().enumerate() {
                let resolved = resolve(child, registry);
                match rebuilt.as_mut() {
                    Some(children) => children.push(resolved),
                    None if !Arc::ptr_eq(&resolved, child) => {
                        let mut children = Vec::with_capacity(composite.sub_conditions.len());
                        children.extend(composite.sub_conditions[..i].iter().cloned());
                        children.push(resolved);
                        rebuilt = Some(children);
                    }
                    None => {}
                }
            }

            match rebuilt {
                None => Arc::clone(node),
                Some(sub_conditions) => Arc::new(Condition::Composite(CompositeCondition {
                    condition_type_id: composite.condition_type_id.clone(),
                    operator: composite.operator,
                    sub_conditions,
                })),
            }
        }
    }
}

/// 条件的序列化形式
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition_type_id: Option<String>,
    #[serde(default)]
    parameter_values: RawParameters,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_conditions: Option<Vec<Arc<Condition>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operator: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl TryFrom<RawCondition> for Condition {
    type Error = RuleError;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        let RawParameters {
            sub_conditions,
            operator,
            mut rest,
        } = raw.parameter_values;

        match sub_conditions {
            Some(sub_conditions) => {
                let operator = match operator {
                    None => LogicalOperator::And,
                    Some(Value::String(op)) => op.parse()?,
                    Some(other) => {
                        return Err(RuleError::InvalidOperator(other.to_string()));
                    }
                };
                Ok(Self::Composite(CompositeCondition {
                    condition_type_id: raw
                        .condition_type_id
                        .unwrap_or_else(|| BOOLEAN_CONDITION_TYPE.to_string()),
                    operator,
                    sub_conditions,
                }))
            }
            None => {
                let condition_type_id = raw.condition_type_id.ok_or_else(|| {
                    RuleError::InvalidCondition("叶子条件缺少 conditionTypeId".to_string())
                })?;
                // 叶子条件的 operator 只是普通参数
                if let Some(operator) = operator {
                    rest.insert("operator".to_string(), operator);
                }
                Ok(Self::Leaf(LeafCondition::new(condition_type_id, rest)))
            }
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Leaf(leaf) => Self {
                condition_type_id: Some(leaf.condition_type_id),
                parameter_values: RawParameters {
                    sub_conditions: None,
                    operator: None,
                    rest: leaf.parameter_values,
                },
            },
            Condition::Composite(composite) => Self {
                condition_type_id: Some(composite.condition_type_id),
                parameter_values: RawParameters {
                    sub_conditions: Some(composite.sub_conditions),
                    operator: Some(Value::String(composite.operator.as_str().to_string())),
                    rest: Map::new(),
                },
            },
        }
    }
}
