//! 规则引擎领域模型

use crate::condition::{self, Condition};
use crate::registry::{ActionType, Resolution, TypeRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// 保留作用域：适用于任何作用域的事件
pub const SYSTEM_SCOPE: &str = "systemscope";

/// ruleFired 派生事件类型
pub const RULE_FIRED_EVENT_TYPE: &str = "ruleFired";

/// 规则条目类型，用作 ruleFired 事件的 target 类型
pub const RULE_ITEM_TYPE: &str = "rule";

fn system_scope() -> String {
    SYSTEM_SCOPE.to_string()
}

fn enabled_by_default() -> bool {
    true
}

/// 规则元数据
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default = "system_scope")]
    pub scope: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// 仅由插件可用性跟踪器与规则加载流程修改
    #[serde(default)]
    pub missing_plugins: bool,
}

impl Metadata {
    pub fn new(scope: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scope: scope.into(),
            name: None,
            description: None,
            enabled: true,
            missing_plugins: false,
        }
    }

    /// 带作用域的唯一标识，同时作为持久化主键
    pub fn id_with_scope(&self) -> String {
        id_with_scope(&self.scope, &self.id)
    }

    pub fn applies_to_scope(&self, scope: &str) -> bool {
        self.scope == SYSTEM_SCOPE || self.scope == scope
    }
}

pub fn id_with_scope(scope: &str, id: &str) -> String {
    format!("{}_{}", scope, id)
}

/// 规则动作
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type_id: String,
    #[serde(default)]
    pub parameter_values: Map<String, Value>,
    #[serde(skip)]
    action_type: Resolution<ActionType>,
}

impl Action {
    pub fn new(action_type_id: impl Into<String>, parameter_values: Map<String, Value>) -> Self {
        Self {
            action_type_id: action_type_id.into(),
            parameter_values,
            action_type: Resolution::Unresolved,
        }
    }

    pub fn action_type(&self) -> Option<&ActionType> {
        self.action_type.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.action_type.is_resolved()
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameter_values.get(name)
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.action_type_id == other.action_type_id
            && self.parameter_values == other.parameter_values
    }
}

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub metadata: Metadata,
    pub condition: Arc<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub raise_event_only_once_for_profile: bool,
    #[serde(default)]
    pub raise_event_only_once_for_session: bool,
}

impl Rule {
    pub fn new(metadata: Metadata, condition: Condition) -> Self {
        Self {
            metadata,
            condition: Arc::new(condition),
            actions: Vec::new(),
            raise_event_only_once_for_profile: false,
            raise_event_only_once_for_session: false,
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn item_id(&self) -> String {
        self.metadata.id_with_scope()
    }

    /// 条件树与所有动作是否都已解析
    pub fn is_fully_resolved(&self) -> bool {
        self.condition.is_fully_resolved() && self.actions.iter().all(Action::is_resolved)
    }

    /// 针对当前注册表解析条件树与动作
    ///
    /// 无变化时返回原规则实例本身。
    pub fn resolved(self: &Arc<Self>, registry: &dyn TypeRegistry) -> Arc<Rule> {
        let condition = condition::resolve(&self.condition, registry);
        let condition_changed = !Arc::ptr_eq(&condition, &self.condition);

        let action_types: Vec<Resolution<ActionType>> = self
            .actions
            .iter()
            .map(|action| registry.action_type(&action.action_type_id))
            .collect();
        let actions_changed = action_types
            .iter()
            .zip(&self.actions)
            .any(|(resolution, action)| !resolution.same_as(&action.action_type));

        if !condition_changed && !actions_changed {
            return Arc::clone(self);
        }

        let mut rule = Rule::clone(self);
        rule.condition = condition;
        for (action, resolution) in rule.actions.iter_mut().zip(action_types) {
            action.action_type = resolution;
        }
        Arc::new(rule)
    }
}

/// 条目引用（事件来源、目标）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub item_id: String,
    pub item_type: String,
}

impl ItemRef {
    pub fn new(item_id: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: item_type.into(),
        }
    }
}

/// 访客档案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub item_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub segments: Vec<String>,
}

impl Profile {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            properties: Map::new(),
            segments: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub item_id: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Session {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            scope: None,
            profile_id: None,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// 通用条目，用于 getTrackedConditions 的来源事件约束匹配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub item_id: String,
    pub item_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Item {
    pub fn new(item_id: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: item_type.into(),
            scope: None,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

fn persistent_by_default() -> bool {
    true
}

/// 行为事件
///
/// 匹配过程中视为不可变输入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub item_id: String,
    pub event_type: String,
    pub scope: String,
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub source: Option<ItemRef>,
    #[serde(default)]
    pub target: Option<ItemRef>,
    #[serde(default = "Utc::now")]
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// 瞬态属性，随派生事件传递
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default = "persistent_by_default")]
    pub persistent: bool,
    /// 派生深度：外部事件为 0，每经过一次 ruleFired 派生加 1
    #[serde(default)]
    pub derivation_depth: u32,
}

fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

impl Event {
    pub fn new(event_type: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            item_id: new_event_id(),
            event_type: event_type.into(),
            scope: scope.into(),
            session: None,
            profile: None,
            source: None,
            target: None,
            time_stamp: Utc::now(),
            properties: Map::new(),
            attributes: Map::new(),
            persistent: true,
            derivation_depth: 0,
        }
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_target(mut self, target: ItemRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn profile_id(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.item_id.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.item_id.as_str())
    }

    /// 为命中的规则构建 ruleFired 派生事件
    ///
    /// 继承原事件的作用域、会话、档案、来源与全部属性，以规则为目标，且不持久化。
    pub fn rule_fired(&self, rule: &Rule) -> Event {
        Event {
            item_id: new_event_id(),
            event_type: RULE_FIRED_EVENT_TYPE.to_string(),
            scope: self.scope.clone(),
            session: self.session.clone(),
            profile: self.profile.clone(),
            source: self.source.clone(),
            target: Some(ItemRef::new(rule.item_id(), RULE_ITEM_TYPE)),
            time_stamp: self.time_stamp,
            properties: Map::new(),
            attributes: self.attributes.clone(),
            persistent: false,
            derivation_depth: self.derivation_depth.saturating_add(1),
        }
    }
}
