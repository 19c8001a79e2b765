//! 规则服务
//!
//! 对宿主系统暴露的入口：规则匹配、事件处理、规则目录读写与被追踪条件查询。

use crate::catalog::RuleCatalog;
use crate::condition::{tags, Condition, SOURCE_EVENT_PROPERTY_CONDITION_TYPE};
use crate::dispatcher::ActionDispatcher;
use crate::error::{Result, RuleError};
use crate::extractor::{extract_all_by_type, extract_by_tag};
use crate::matcher::RuleMatcher;
use crate::models::{id_with_scope, Event, Item, Metadata, Rule};
use crate::ports::{ActionExecutor, EventBus, EventHistory, RulePersistence, RuleQuery};
use crate::registry::TypeRegistry;
use crate::subject::Subject;
use crate::tracker::PluginAvailabilityTracker;
use crate::validator::RuleValidator;
use context_shared::config::RuleEngineConfig;
use context_shared::observability::metrics::RULE_AVAILABILITY_TRANSITIONS_TOTAL;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 规则服务依赖的外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn TypeRegistry>,
    pub persistence: Arc<dyn RulePersistence>,
    pub history: Arc<dyn EventHistory>,
    pub executor: Arc<dyn ActionExecutor>,
    pub bus: Arc<dyn EventBus>,
}

/// 规则服务
#[derive(Clone)]
pub struct RulesService {
    catalog: RuleCatalog,
    matcher: RuleMatcher,
    dispatcher: ActionDispatcher,
    tracker: PluginAvailabilityTracker,
    config: RuleEngineConfig,
}

impl RulesService {
    pub fn new(collaborators: Collaborators, config: RuleEngineConfig) -> Self {
        let Collaborators {
            registry,
            persistence,
            history,
            executor,
            bus,
        } = collaborators;

        let catalog = RuleCatalog::new(persistence, registry);
        let matcher = RuleMatcher::new(catalog.clone(), history, config.clone());
        let dispatcher = ActionDispatcher::new(executor, bus);
        let tracker = PluginAvailabilityTracker::new(catalog.clone());

        Self {
            catalog,
            matcher,
            dispatcher,
            tracker,
            config,
        }
    }

    /// 从持久化层重建规则目录快照（启动时调用）
    pub async fn refresh_catalog(&self) -> Result<usize> {
        self.catalog.refresh().await
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// 供宿主进程在模块启停时调用
    pub fn availability_tracker(&self) -> &PluginAvailabilityTracker {
        &self.tracker
    }

    /// 事件命中的规则（目录顺序，去重）
    pub async fn get_matching_rules(&self, event: &Event) -> Vec<Arc<Rule>> {
        self.matcher.matching_rules(event).await
    }

    /// 处理事件：依次分发命中的规则，返回是否有动作报告状态改变
    #[instrument(skip(self, event), fields(
        event_id = %event.item_id,
        event_type = %event.event_type,
        depth = event.derivation_depth
    ))]
    pub async fn on_event(&self, event: &Event) -> bool {
        let max_depth = self.config.max_rule_fired_depth;
        if max_depth > 0 && event.derivation_depth >= max_depth {
            warn!(
                max_depth,
                "ruleFired 派生深度已达上限，事件不再参与匹配，请检查规则是否存在循环"
            );
            return false;
        }

        let rules = self.get_matching_rules(event).await;

        let mut changed = false;
        for rule in &rules {
            changed |= self.dispatcher.dispatch(rule, event).await;
        }
        changed
    }

    /// 创建或更新规则
    ///
    /// 写入前针对当前注册表解析规则：存在未解析的条件或动作类型时标记为缺失插件，
    /// 完全解析时清除该标记。`missingPlugins` 不由调用方指定。
    /// 启用且未缺失插件的规则在写入前预演标签提取，存在歧义时拒绝写入。
    #[instrument(skip(self, rule), fields(rule_id = %rule.item_id()))]
    pub async fn set_rule(&self, rule: Rule) -> Result<Arc<Rule>> {
        let key = rule.item_id();

        if self.config.validate_on_write {
            RuleValidator::validate(&rule)?;
        }

        let _guard = self.catalog.lock(&key).await;

        let was_missing = self
            .catalog
            .load(&key)
            .await?
            .is_some_and(|existing| existing.metadata.missing_plugins);

        let resolved = Arc::new(rule).resolved(self.catalog.registry().as_ref());
        let mut rule = Rule::clone(&resolved);
        rule.metadata.missing_plugins = !resolved.is_fully_resolved();

        match (was_missing, rule.metadata.missing_plugins) {
            (false, true) => {
                warn!(rule_id = %key, "规则依赖的插件不可用，标记为缺失插件");
                metrics::counter!(RULE_AVAILABILITY_TRANSITIONS_TOTAL, "transition" => "disabled")
                    .increment(1);
            }
            (true, false) => {
                info!(rule_id = %key, "规则已可完全解析，清除缺失插件标记");
                metrics::counter!(RULE_AVAILABILITY_TRANSITIONS_TOTAL, "transition" => "enabled")
                    .increment(1);
            }
            _ => {}
        }

        if self.config.validate_on_write
            && rule.metadata.enabled
            && !rule.metadata.missing_plugins
        {
            RuleValidator::validate_extraction(&rule.condition)?;
        }

        self.catalog.persist(rule).await
    }

    /// 按作用域与 id 读取规则（已针对当前注册表解析）
    pub async fn get_rule(&self, scope: &str, id: &str) -> Result<Option<Arc<Rule>>> {
        let rule = self.catalog.load(&id_with_scope(scope, id)).await?;
        Ok(rule.map(|rule| Arc::new(rule).resolved(self.catalog.registry().as_ref())))
    }

    /// 删除规则
    #[instrument(skip(self))]
    pub async fn remove_rule(&self, scope: &str, id: &str) -> Result<()> {
        let key = id_with_scope(scope, id);
        let _guard = self.catalog.lock(&key).await;

        if self.catalog.delete(&key).await? {
            Ok(())
        } else {
            warn!("删除不存在的规则: {}", key);
            Err(RuleError::RuleNotFound(key))
        }
    }

    /// 列出规则元数据，指定作用域时只列出该作用域的规则
    pub async fn get_rule_metadatas(&self, scope: Option<&str>) -> Result<Vec<Metadata>> {
        let persistence = self.catalog.persistence();
        let rules = match scope {
            Some(scope) => {
                persistence
                    .query_rules(&RuleQuery::Scope(scope.to_string()))
                    .await?
            }
            None => persistence.all_rules().await?,
        };

        let mut metadatas: Vec<Metadata> = Vec::with_capacity(rules.len());
        for rule in rules {
            if !metadatas.contains(&rule.metadata) {
                metadatas.push(rule.metadata);
            }
        }
        Ok(metadatas)
    }

    /// 收集所有规则的被追踪条件
    ///
    /// 规则带有 sourceEventPropertyCondition 叶子时，这些叶子必须全部匹配 `item`；
    /// `item` 为空时只收集不带此类叶子的规则。
    pub async fn get_tracked_conditions(&self, item: Option<&Item>) -> Vec<Arc<Condition>> {
        let snapshot = self.catalog.snapshot();
        let registry = self.catalog.registry();

        let mut tracked: Vec<Arc<Condition>> = Vec::new();
        for rule in snapshot.iter() {
            let rule = rule.resolved(registry.as_ref());
            match self.tracked_condition(&rule, item).await {
                Ok(Some(condition)) => {
                    if !tracked.contains(&condition) {
                        tracked.push(condition);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rule_id = %rule.item_id(), error = %e, "提取被追踪条件失败，已跳过");
                }
            }
        }

        info!("共收集 {} 个被追踪条件", tracked.len());
        tracked
    }

    async fn tracked_condition(
        &self,
        rule: &Rule,
        item: Option<&Item>,
    ) -> Result<Option<Arc<Condition>>> {
        let Some(tracked) = extract_by_tag(&rule.condition, tags::TRACKED_CONDITION)? else {
            return Ok(None);
        };

        let sources = extract_all_by_type(&rule.condition, SOURCE_EVENT_PROPERTY_CONDITION_TYPE);
        if sources.is_empty() {
            return Ok(Some(tracked));
        }

        let Some(item) = item else {
            return Ok(None);
        };
        for source in &sources {
            if !self
                .catalog
                .persistence()
                .test_match(source, Subject::Item(item))
                .await?
            {
                return Ok(None);
            }
        }

        Ok(Some(tracked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        ChannelEventBus, InMemoryEventHistory, InMemoryRulePersistence, InMemoryTypeRegistry,
        RecordingActionExecutor,
    };
    use crate::models::{Action, Profile, RULE_FIRED_EVENT_TYPE};
    use crate::registry::{ActionType, ConditionType};
    use serde_json::{json, Map, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        service: RulesService,
        persistence: Arc<InMemoryRulePersistence>,
        executor: Arc<RecordingActionExecutor>,
        events: UnboundedReceiver<Event>,
    }

    fn fixture_with(config: RuleEngineConfig) -> Fixture {
        let registry = Arc::new(InMemoryTypeRegistry::new());
        registry.register_module(
            "core",
            vec![
                ConditionType::new("eventTypeCondition", [tags::EVENT_CONDITION]),
                ConditionType::new("profilePropertyCondition", [tags::PROFILE_CONDITION]),
                ConditionType::new(
                    "pageViewCountCondition",
                    [tags::PROFILE_CONDITION, tags::TRACKED_CONDITION],
                ),
                ConditionType::new(SOURCE_EVENT_PROPERTY_CONDITION_TYPE, [tags::EVENT_CONDITION]),
            ],
            vec![ActionType::new("setPropertyAction"), ActionType::new("logAction")],
        );
        let persistence = Arc::new(InMemoryRulePersistence::new());
        let executor = Arc::new(RecordingActionExecutor::new().with_no_change("logAction"));
        let (bus, events) = ChannelEventBus::new();

        let service = RulesService::new(
            Collaborators {
                registry,
                persistence: persistence.clone(),
                history: Arc::new(InMemoryEventHistory::new()),
                executor: executor.clone(),
                bus: Arc::new(bus),
            },
            config,
        );

        Fixture {
            service,
            persistence,
            executor,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RuleEngineConfig::default())
    }

    fn rule(scope: &str, id: &str, condition: Value, actions: &[&str]) -> Rule {
        Rule::new(
            Metadata::new(scope, id),
            serde_json::from_value(condition).unwrap(),
        )
        .with_actions(actions.iter().map(|a| Action::new(*a, Map::new())).collect())
    }

    fn on_type(event_type: &str) -> Value {
        json!({ "conditionTypeId": "eventTypeCondition", "parameterValues": { "eventTypeId": event_type } })
    }

    #[tokio::test]
    async fn test_set_get_remove_rule() {
        let f = fixture();

        f.service
            .set_rule(rule("site-a", "r1", on_type("view"), &["setPropertyAction"]))
            .await
            .unwrap();

        let loaded = f.service.get_rule("site-a", "r1").await.unwrap().unwrap();
        assert!(loaded.is_fully_resolved());
        assert!(f.service.get_rule("site-b", "r1").await.unwrap().is_none());

        f.service.remove_rule("site-a", "r1").await.unwrap();
        assert!(f.service.get_rule("site-a", "r1").await.unwrap().is_none());
        assert!(matches!(
            f.service.remove_rule("site-a", "r1").await,
            Err(RuleError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_rule_rejects_ambiguous_tree() {
        let f = fixture();
        let ambiguous = rule(
            "site-a",
            "ambiguous",
            json!({
                "parameterValues": {
                    "operator": "or",
                    "subConditions": [
                        on_type("view"),
                        { "conditionTypeId": "profilePropertyCondition", "parameterValues": {} }
                    ]
                }
            }),
            &[],
        );

        let result = f.service.set_rule(ambiguous.clone()).await;

        assert!(matches!(result, Err(RuleError::AmbiguousExtraction { .. })));
        assert!(f.persistence.is_empty());

        // 禁用的规则不做提取预演
        let mut disabled = ambiguous;
        disabled.metadata.enabled = false;
        assert!(f.service.set_rule(disabled).await.is_ok());
    }

    fn geo_rule(id: &str) -> Rule {
        rule(
            "site-a",
            id,
            json!({
                "parameterValues": {
                    "operator": "and",
                    "subConditions": [
                        on_type("view"),
                        { "conditionTypeId": "geoCondition", "parameterValues": { "propertyName": "properties.country", "propertyValue": "FR" } }
                    ]
                }
            }),
            &[],
        )
    }

    #[tokio::test]
    async fn test_set_rule_marks_unresolvable_rule_missing() {
        let f = fixture();

        let saved = f.service.set_rule(geo_rule("geo")).await.unwrap();

        assert!(saved.metadata.missing_plugins);
        assert!(!saved.is_fully_resolved());
        let stored = f.persistence.load("site-a_geo").await.unwrap().unwrap();
        assert!(stored.metadata.missing_plugins);
    }

    #[tokio::test]
    async fn test_set_rule_ignores_caller_missing_plugins_flag() {
        let f = fixture();
        let mut flagged = geo_rule("r1");
        flagged.metadata.missing_plugins = true;
        f.persistence.save(&flagged).await.unwrap();

        // 仍无法解析：调用方无法清除标记
        let mut update = geo_rule("r1");
        update.metadata.missing_plugins = false;
        assert!(f.service.set_rule(update).await.unwrap().metadata.missing_plugins);

        // 可完全解析：调用方也无法设置标记
        let mut resolvable = rule("site-a", "r2", on_type("view"), &[]);
        resolvable.metadata.missing_plugins = true;
        assert!(!f.service.set_rule(resolvable).await.unwrap().metadata.missing_plugins);
    }

    #[tokio::test]
    async fn test_set_rule_clears_flag_when_missing_reference_removed() {
        let f = fixture();
        f.service.set_rule(geo_rule("r1")).await.unwrap();

        let saved = f
            .service
            .set_rule(rule("site-a", "r1", on_type("view"), &[]))
            .await
            .unwrap();

        assert!(!saved.metadata.missing_plugins);
        let matched = f
            .service
            .get_matching_rules(&Event::new("view", "site-a"))
            .await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].item_id(), "site-a_r1");
    }

    #[tokio::test]
    async fn test_get_rule_metadatas() {
        let f = fixture();
        for (scope, id) in [("site-a", "r1"), ("site-a", "r2"), ("site-b", "r3")] {
            f.service
                .set_rule(rule(scope, id, on_type("view"), &[]))
                .await
                .unwrap();
        }

        assert_eq!(f.service.get_rule_metadatas(None).await.unwrap().len(), 3);
        let site_a = f.service.get_rule_metadatas(Some("site-a")).await.unwrap();
        assert_eq!(site_a.len(), 2);
        assert!(site_a.iter().all(|m| m.scope == "site-a"));
    }

    #[tokio::test]
    async fn test_on_event_dispatches_and_publishes() {
        let mut f = fixture();
        f.service
            .set_rule(rule("site-a", "changes", on_type("view"), &["setPropertyAction"]))
            .await
            .unwrap();
        f.service
            .set_rule(rule("site-a", "quiet", on_type("view"), &["logAction"]))
            .await
            .unwrap();

        let event = Event::new("view", "site-a").with_profile(Profile::new("p1"));
        assert!(f.service.on_event(&event).await);

        let first = f.events.recv().await.unwrap();
        let second = f.events.recv().await.unwrap();
        assert_eq!(first.event_type, RULE_FIRED_EVENT_TYPE);
        assert_eq!(first.target.unwrap().item_id, "site-a_changes");
        assert_eq!(second.target.unwrap().item_id, "site-a_quiet");
        assert_eq!(f.executor.executions().len(), 2);
    }

    #[tokio::test]
    async fn test_on_event_without_change_still_publishes() {
        let mut f = fixture();
        f.service
            .set_rule(rule("site-a", "quiet", on_type("view"), &["logAction"]))
            .await
            .unwrap();

        assert!(!f.service.on_event(&Event::new("view", "site-a")).await);
        assert!(f.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_rule_fired_depth_cap() {
        let mut f = fixture_with(RuleEngineConfig {
            max_rule_fired_depth: 2,
            ..RuleEngineConfig::default()
        });
        f.service
            .set_rule(rule(
                "site-a",
                "loop",
                on_type(RULE_FIRED_EVENT_TYPE),
                &["setPropertyAction"],
            ))
            .await
            .unwrap();

        let mut event = Event::new(RULE_FIRED_EVENT_TYPE, "site-a");
        event.derivation_depth = 1;
        assert!(f.service.on_event(&event).await);

        let derived = f.events.recv().await.unwrap();
        assert_eq!(derived.derivation_depth, 2);
        assert!(!f.service.on_event(&derived).await);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tracked_conditions() {
        let f = fixture();
        let tracked_leaf = json!({
            "conditionTypeId": "pageViewCountCondition",
            "parameterValues": { "propertyName": "properties.views", "propertyValue": 3 }
        });
        let source_leaf = json!({
            "conditionTypeId": SOURCE_EVENT_PROPERTY_CONDITION_TYPE,
            "parameterValues": { "propertyName": "itemType", "propertyValue": "page" }
        });

        f.service
            .set_rule(rule(
                "site-a",
                "unconstrained",
                json!({
                    "parameterValues": {
                        "operator": "and",
                        "subConditions": [on_type("view"), tracked_leaf.clone()]
                    }
                }),
                &[],
            ))
            .await
            .unwrap();
        f.service
            .set_rule(rule(
                "site-a",
                "page-only",
                json!({
                    "parameterValues": {
                        "operator": "and",
                        "subConditions": [
                            source_leaf,
                            {
                                "conditionTypeId": "pageViewCountCondition",
                                "parameterValues": { "propertyName": "properties.views", "propertyValue": 5 }
                            }
                        ]
                    }
                }),
                &[],
            ))
            .await
            .unwrap();
        f.service
            .set_rule(rule("site-a", "untracked", on_type("view"), &[]))
            .await
            .unwrap();

        assert_eq!(f.service.get_tracked_conditions(None).await.len(), 1);

        let page = Item::new("home", "page");
        assert_eq!(f.service.get_tracked_conditions(Some(&page)).await.len(), 2);

        let product = Item::new("sku-1", "product");
        let tracked = f.service.get_tracked_conditions(Some(&product)).await;
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].condition_type_id(), "pageViewCountCondition");
    }
}
