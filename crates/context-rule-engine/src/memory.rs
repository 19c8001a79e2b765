//! 内存协作方实现
//!
//! 用于演示进程、集成测试与基准测试。

use crate::condition::Condition;
use crate::error::{Result, RuleError};
use crate::executor::ConditionExecutor;
use crate::models::{Action, Event, Rule};
use crate::ports::{ActionExecutor, EventBus, EventHistory, RulePersistence, RuleQuery};
use crate::registry::{ActionType, ConditionType, ModuleTypes, Resolution, TypeRegistry};
use crate::subject::Subject;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 内存类型注册表
///
/// 以模块为单位登记与撤回类型。描述符以 `Arc` 持有，
/// 同一 id 在重新登记前总是解析为同一实例。
#[derive(Default)]
pub struct InMemoryTypeRegistry {
    condition_types: DashMap<String, Arc<ConditionType>>,
    action_types: DashMap<String, Arc<ActionType>>,
    modules: DashMap<String, ModuleTypes>,
}

impl InMemoryTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记模块提供的类型，返回该模块的类型 id 集合
    pub fn register_module(
        &self,
        module_id: &str,
        condition_types: Vec<ConditionType>,
        action_types: Vec<ActionType>,
    ) -> ModuleTypes {
        let mut types = ModuleTypes::default();

        for ty in condition_types {
            types.condition_type_ids.insert(ty.id.clone());
            self.condition_types.insert(ty.id.clone(), Arc::new(ty));
        }
        for ty in action_types {
            types.action_type_ids.insert(ty.id.clone());
            self.action_types.insert(ty.id.clone(), Arc::new(ty));
        }

        self.modules
            .entry(module_id.to_string())
            .and_modify(|existing| {
                existing
                    .condition_type_ids
                    .extend(types.condition_type_ids.iter().cloned());
                existing
                    .action_type_ids
                    .extend(types.action_type_ids.iter().cloned());
            })
            .or_insert_with(|| types.clone());

        info!(
            module_id,
            condition_types = types.condition_type_ids.len(),
            action_types = types.action_type_ids.len(),
            "模块类型已登记"
        );
        types
    }

    /// 撤回模块提供的全部类型
    pub fn unregister_module(&self, module_id: &str) -> Option<ModuleTypes> {
        let (_, types) = self.modules.remove(module_id)?;

        for id in &types.condition_type_ids {
            self.condition_types.remove(id);
        }
        for id in &types.action_type_ids {
            self.action_types.remove(id);
        }

        info!(module_id, "模块类型已撤回");
        Some(types)
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.modules.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl TypeRegistry for InMemoryTypeRegistry {
    fn condition_type(&self, type_id: &str) -> Resolution<ConditionType> {
        self.condition_types
            .get(type_id)
            .map(|ty| Resolution::Resolved(Arc::clone(ty.value())))
            .unwrap_or_default()
    }

    fn action_type(&self, type_id: &str) -> Resolution<ActionType> {
        self.action_types
            .get(type_id)
            .map(|ty| Resolution::Resolved(Arc::clone(ty.value())))
            .unwrap_or_default()
    }

    fn types_by_module(&self, module_id: &str) -> ModuleTypes {
        self.modules
            .get(module_id)
            .map(|types| types.value().clone())
            .unwrap_or_default()
    }
}

/// 内存规则持久化
///
/// 保持插入顺序，`test_match` 使用 [`ConditionExecutor`] 求值。
#[derive(Default)]
pub struct InMemoryRulePersistence {
    rules: RwLock<Vec<Rule>>,
    executor: ConditionExecutor,
}

impl InMemoryRulePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            executor: ConditionExecutor::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[async_trait]
impl RulePersistence for InMemoryRulePersistence {
    async fn test_match(&self, condition: &Condition, subject: Subject<'_>) -> Result<bool> {
        let context = subject.to_evaluation_context()?;
        self.executor.matches(condition, &context)
    }

    async fn all_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.read().clone())
    }

    async fn load(&self, id_with_scope: &str) -> Result<Option<Rule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .find(|rule| rule.item_id() == id_with_scope)
            .cloned())
    }

    async fn save(&self, rule: &Rule) -> Result<()> {
        let key = rule.item_id();
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|existing| existing.item_id() == key) {
            Some(existing) => *existing = rule.clone(),
            None => rules.push(rule.clone()),
        }
        Ok(())
    }

    async fn remove(&self, id_with_scope: &str) -> Result<bool> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.item_id() != id_with_scope);
        Ok(rules.len() != before)
    }

    async fn query_rules(&self, query: &RuleQuery) -> Result<Vec<Rule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|rule| query.matches(rule))
            .cloned()
            .collect())
    }
}

/// 内存事件历史
///
/// 以（事件类型, 目标, 档案或会话）为键记录已触发事件。
#[derive(Default)]
pub struct InMemoryEventHistory {
    raised: DashSet<String>,
}

impl InMemoryEventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录事件，同时登记档案与会话两个维度
    pub fn record(&self, event: &Event) {
        for session_scope in [false, true] {
            if let Some(key) = Self::key(event, session_scope) {
                self.raised.insert(key);
            }
        }
    }

    fn key(event: &Event, session_scope: bool) -> Option<String> {
        let owner = if session_scope {
            format!("session:{}", event.session_id()?)
        } else {
            format!("profile:{}", event.profile_id()?)
        };
        let target = event
            .target
            .as_ref()
            .map(|t| format!("{}/{}", t.item_type, t.item_id))
            .unwrap_or_default();
        Some(format!("{}|{}|{}", event.event_type, target, owner))
    }
}

#[async_trait]
impl EventHistory for InMemoryEventHistory {
    async fn has_event_already_been_raised(
        &self,
        event: &Event,
        session_scope: bool,
    ) -> Result<bool> {
        Ok(Self::key(event, session_scope).is_some_and(|key| self.raised.contains(&key)))
    }
}

/// 已执行动作的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    pub action_type_id: String,
    pub event_id: String,
    pub event_type: String,
}

/// 记录型动作执行器
///
/// 默认所有动作都报告状态已改变，可按类型 id 关闭。
#[derive(Default)]
pub struct RecordingActionExecutor {
    unchanged_types: HashSet<String>,
    executions: Mutex<Vec<ExecutedAction>>,
}

impl RecordingActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定类型的动作报告“未改变”
    pub fn with_no_change(mut self, action_type_id: impl Into<String>) -> Self {
        self.unchanged_types.insert(action_type_id.into());
        self
    }

    pub fn executions(&self) -> Vec<ExecutedAction> {
        self.executions.lock().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingActionExecutor {
    async fn execute(&self, action: &Action, event: &Event) -> Result<bool> {
        debug!(
            action_type_id = %action.action_type_id,
            event_type = %event.event_type,
            "执行动作"
        );
        self.executions.lock().push(ExecutedAction {
            action_type_id: action.action_type_id.clone(),
            event_id: event.item_id.clone(),
            event_type: event.event_type.clone(),
        });
        Ok(!self.unchanged_types.contains(&action.action_type_id))
    }
}

/// 基于 tokio 通道的事件总线
pub struct ChannelEventBus {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelEventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| RuleError::Publish(format!("事件通道已关闭: {}", e.0.event_type)))
    }
}
