//! 条件/动作类型注册表契约
//!
//! 类型由宿主进程中的模块提供，运行时可增可减。引擎只通过 [`TypeRegistry`]
//! 按 id 解析类型，解析结果显式区分 [`Resolution::Resolved`] 与 [`Resolution::Unresolved`]。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// 类型解析结果
pub enum Resolution<T> {
    Resolved(Arc<T>),
    Unresolved,
}

impl<T> Resolution<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Resolved(t) => Some(t),
            Self::Unresolved => None,
        }
    }

    /// 两次解析是否指向同一个描述符实例
    ///
    /// 注册表以 `Arc` 持有描述符，未变化的注册表对同一 id 总是返回同一实例。
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Resolved(a), Self::Resolved(b)) => Arc::ptr_eq(a, b),
            (Self::Unresolved, Self::Unresolved) => true,
            _ => false,
        }
    }
}

impl<T> Clone for Resolution<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Resolved(t) => Self::Resolved(Arc::clone(t)),
            Self::Unresolved => Self::Unresolved,
        }
    }
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Self::Unresolved
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(t) => f.debug_tuple("Resolved").field(t).finish(),
            Self::Unresolved => f.write_str("Unresolved"),
        }
    }
}

/// 条件类型描述符
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionType {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 语义标签，如 eventCondition、profileCondition
    #[serde(default, rename = "tagIds")]
    pub tags: BTreeSet<String>,
}

impl ConditionType {
    pub fn new<I, S>(id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: None,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// 动作类型描述符
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionType {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ActionType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// 某个模块提供的类型 id 集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleTypes {
    pub condition_type_ids: BTreeSet<String>,
    pub action_type_ids: BTreeSet<String>,
}

impl ModuleTypes {
    pub fn is_empty(&self) -> bool {
        self.condition_type_ids.is_empty() && self.action_type_ids.is_empty()
    }
}

/// 类型注册表
pub trait TypeRegistry: Send + Sync {
    /// 按 id 解析条件类型
    fn condition_type(&self, type_id: &str) -> Resolution<ConditionType>;

    /// 按 id 解析动作类型
    fn action_type(&self, type_id: &str) -> Resolution<ActionType>;

    /// 查询某模块提供（或即将撤回）的类型 id
    fn types_by_module(&self, module_id: &str) -> ModuleTypes;
}
