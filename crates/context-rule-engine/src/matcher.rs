//! 规则匹配
//!
//! 对目录快照中的每条规则依次执行：作用域过滤、类型解析、事件条件、去重、
//! 档案条件、会话条件。单条规则的失败只会使该规则在本次匹配中被排除。

use crate::catalog::RuleCatalog;
use crate::condition::tags;
use crate::error::Result;
use crate::extractor::extract_by_tag;
use crate::models::{Event, Rule};
use crate::ports::EventHistory;
use crate::subject::Subject;
use context_shared::config::RuleEngineConfig;
use context_shared::observability::metrics::{
    RULE_EVALUATION_FAILURES_TOTAL, RULE_MATCHES_TOTAL, RULE_MATCHING_DURATION_SECONDS,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// 单次匹配内的去重结果缓存
///
/// 档案与会话两个维度各自最多查询一次事件历史。
#[derive(Debug, Default)]
struct DedupCache {
    profile: Option<bool>,
    session: Option<bool>,
}

impl DedupCache {
    async fn already_raised(
        &mut self,
        history: &dyn EventHistory,
        event: &Event,
        session_scope: bool,
    ) -> Result<bool> {
        let slot = if session_scope {
            &mut self.session
        } else {
            &mut self.profile
        };

        if let Some(raised) = *slot {
            return Ok(raised);
        }

        let raised = history
            .has_event_already_been_raised(event, session_scope)
            .await?;
        *slot = Some(raised);
        Ok(raised)
    }
}

/// 规则匹配器
#[derive(Clone)]
pub struct RuleMatcher {
    catalog: RuleCatalog,
    history: Arc<dyn EventHistory>,
    config: RuleEngineConfig,
}

impl RuleMatcher {
    pub fn new(
        catalog: RuleCatalog,
        history: Arc<dyn EventHistory>,
        config: RuleEngineConfig,
    ) -> Self {
        Self {
            catalog,
            history,
            config,
        }
    }

    /// 返回事件命中的规则，顺序与目录一致，每条规则最多出现一次
    #[instrument(skip(self, event), fields(event_type = %event.event_type, scope = %event.scope))]
    pub async fn matching_rules(&self, event: &Event) -> Vec<Arc<Rule>> {
        let start = Instant::now();
        let snapshot = self.catalog.snapshot();
        let registry = self.catalog.registry();

        let mut dedup = DedupCache::default();
        let mut seen = HashSet::new();
        let mut matched = Vec::new();

        for rule in snapshot.iter() {
            if !rule.metadata.applies_to_scope(&event.scope) {
                continue;
            }
            if self.config.skip_missing_plugins && rule.metadata.missing_plugins {
                debug!(rule_id = %rule.item_id(), "规则缺失插件，跳过");
                continue;
            }
            if self.config.skip_disabled && !rule.metadata.enabled {
                continue;
            }

            let rule = rule.resolved(registry.as_ref());
            if self.config.skip_unresolved && !rule.is_fully_resolved() {
                debug!(rule_id = %rule.item_id(), "规则存在未解析的类型，跳过");
                continue;
            }

            match self.evaluate(&rule, event, &mut dedup).await {
                Ok(true) => {
                    if seen.insert(rule.item_id()) {
                        matched.push(rule);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        rule_id = %rule.item_id(),
                        code = e.code(),
                        error = %e,
                        "规则评估失败，本次匹配已排除该规则"
                    );
                    metrics::counter!(RULE_EVALUATION_FAILURES_TOTAL, "code" => e.code())
                        .increment(1);
                }
            }
        }

        metrics::counter!(RULE_MATCHES_TOTAL).increment(matched.len() as u64);
        metrics::histogram!(RULE_MATCHING_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        debug!("命中 {} 条规则", matched.len());
        matched
    }

    /// 评估单条规则
    async fn evaluate(&self, rule: &Rule, event: &Event, dedup: &mut DedupCache) -> Result<bool> {
        let persistence = self.catalog.persistence();

        let Some(event_condition) = extract_by_tag(&rule.condition, tags::EVENT_CONDITION)? else {
            return Ok(false);
        };
        if !persistence
            .test_match(&event_condition, Subject::Event(event))
            .await?
        {
            return Ok(false);
        }

        // 两个标记同时存在时以档案维度为准
        if rule.raise_event_only_once_for_profile {
            if dedup
                .already_raised(self.history.as_ref(), event, false)
                .await?
            {
                return Ok(false);
            }
        } else if rule.raise_event_only_once_for_session
            && dedup
                .already_raised(self.history.as_ref(), event, true)
                .await?
        {
            return Ok(false);
        }

        if let Some(profile_condition) = extract_by_tag(&rule.condition, tags::PROFILE_CONDITION)? {
            let Some(profile) = event.profile.as_ref() else {
                return Ok(false);
            };
            if !persistence
                .test_match(&profile_condition, Subject::Profile(profile))
                .await?
            {
                return Ok(false);
            }
        }

        if let Some(session_condition) = extract_by_tag(&rule.condition, tags::SESSION_CONDITION)? {
            let Some(session) = event.session.as_ref() else {
                return Ok(false);
            };
            if !persistence
                .test_match(&session_condition, Subject::Session(session))
                .await?
            {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::error::RuleError;
    use crate::memory::{InMemoryRulePersistence, InMemoryTypeRegistry};
    use crate::models::{Metadata, Profile, Session, SYSTEM_SCOPE};
    use crate::ports::MockEventHistory;
    use crate::registry::ConditionType;
    use serde_json::{json, Value};

    fn registry() -> InMemoryTypeRegistry {
        let registry = InMemoryTypeRegistry::new();
        registry.register_module(
            "core",
            vec![
                ConditionType::new("eventTypeCondition", [tags::EVENT_CONDITION]),
                ConditionType::new("profilePropertyCondition", [tags::PROFILE_CONDITION]),
                ConditionType::new("sessionPropertyCondition", [tags::SESSION_CONDITION]),
            ],
            vec![],
        );
        registry
    }

    fn condition(value: Value) -> Condition {
        serde_json::from_value(value).unwrap()
    }

    fn event_type(event_type: &str) -> Value {
        json!({
            "conditionTypeId": "eventTypeCondition",
            "parameterValues": { "eventTypeId": event_type }
        })
    }

    fn profile_age_over(age: i64) -> Value {
        json!({
            "conditionTypeId": "profilePropertyCondition",
            "parameterValues": {
                "propertyName": "properties.age",
                "comparisonOperator": "greaterThan",
                "propertyValue": age
            }
        })
    }

    fn rule(scope: &str, id: &str, tree: Value) -> Rule {
        Rule::new(Metadata::new(scope, id), condition(tree))
    }

    async fn matcher_with(rules: Vec<Rule>, history: MockEventHistory) -> RuleMatcher {
        let catalog = RuleCatalog::new(
            Arc::new(InMemoryRulePersistence::with_rules(rules)),
            Arc::new(registry()),
        );
        catalog.refresh().await.unwrap();
        RuleMatcher::new(catalog, Arc::new(history), RuleEngineConfig::default())
    }

    fn ids(rules: &[Arc<Rule>]) -> Vec<String> {
        rules.iter().map(|r| r.item_id()).collect()
    }

    fn view_event() -> Event {
        Event::new("view", "site-a")
            .with_profile(Profile::new("p1").with_property("age", 30))
            .with_session(Session::new("s1"))
    }

    #[tokio::test]
    async fn test_scope_filter() {
        let matcher = matcher_with(
            vec![
                rule(SYSTEM_SCOPE, "global", event_type("view")),
                rule("site-a", "local", event_type("view")),
                rule("site-b", "other", event_type("view")),
            ],
            MockEventHistory::new(),
        )
        .await;

        let matched = matcher.matching_rules(&view_event()).await;

        assert_eq!(ids(&matched), vec!["systemscope_global", "site-a_local"]);
    }

    #[tokio::test]
    async fn test_rule_without_event_condition_never_matches() {
        let matcher = matcher_with(
            vec![rule("site-a", "profile-only", profile_age_over(18))],
            MockEventHistory::new(),
        )
        .await;

        assert!(matcher.matching_rules(&view_event()).await.is_empty());
    }

    #[tokio::test]
    async fn test_profile_and_session_phases() {
        let matcher = matcher_with(
            vec![
                rule(
                    "site-a",
                    "adult",
                    json!({
                        "parameterValues": {
                            "operator": "and",
                            "subConditions": [event_type("view"), profile_age_over(18)]
                        }
                    }),
                ),
                rule(
                    "site-a",
                    "senior",
                    json!({
                        "parameterValues": {
                            "operator": "and",
                            "subConditions": [event_type("view"), profile_age_over(65)]
                        }
                    }),
                ),
                rule(
                    "site-a",
                    "mobile-session",
                    json!({
                        "parameterValues": {
                            "operator": "and",
                            "subConditions": [
                                event_type("view"),
                                {
                                    "conditionTypeId": "sessionPropertyCondition",
                                    "parameterValues": {
                                        "propertyName": "properties.device",
                                        "propertyValue": "mobile"
                                    }
                                }
                            ]
                        }
                    }),
                ),
            ],
            MockEventHistory::new(),
        )
        .await;

        let event = Event::new("view", "site-a")
            .with_profile(Profile::new("p1").with_property("age", 30))
            .with_session(Session::new("s1").with_property("device", "mobile"));

        assert_eq!(
            ids(&matcher.matching_rules(&event).await),
            vec!["site-a_adult", "site-a_mobile-session"]
        );
    }

    #[tokio::test]
    async fn test_missing_profile_with_profile_condition_does_not_match() {
        let matcher = matcher_with(
            vec![rule(
                "site-a",
                "adult",
                json!({
                    "parameterValues": {
                        "operator": "and",
                        "subConditions": [event_type("view"), profile_age_over(18)]
                    }
                }),
            )],
            MockEventHistory::new(),
        )
        .await;

        assert!(matcher
            .matching_rules(&Event::new("view", "site-a"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_raise_once_for_profile() {
        for (already_raised, expected) in [(true, 0), (false, 1)] {
            let mut history = MockEventHistory::new();
            history
                .expect_has_event_already_been_raised()
                .withf(|_, session_scope| !*session_scope)
                .times(1)
                .returning(move |_, _| Ok(already_raised));

            let mut once = rule("site-a", "once", event_type("view"));
            once.raise_event_only_once_for_profile = true;
            let matcher = matcher_with(vec![once], history).await;

            assert_eq!(matcher.matching_rules(&view_event()).await.len(), expected);
        }
    }

    #[tokio::test]
    async fn test_dedup_lookup_is_memoized_per_call() {
        let mut history = MockEventHistory::new();
        history
            .expect_has_event_already_been_raised()
            .withf(|_, session_scope| !*session_scope)
            .times(1)
            .returning(|_, _| Ok(false));
        history
            .expect_has_event_already_been_raised()
            .withf(|_, session_scope| *session_scope)
            .times(1)
            .returning(|_, _| Ok(true));

        let mut rules = Vec::new();
        for i in 0..3 {
            let mut r = rule("site-a", &format!("profile-{}", i), event_type("view"));
            r.raise_event_only_once_for_profile = true;
            rules.push(r);
        }
        for i in 0..3 {
            let mut r = rule("site-a", &format!("session-{}", i), event_type("view"));
            r.raise_event_only_once_for_session = true;
            rules.push(r);
        }
        let matcher = matcher_with(rules, history).await;

        let matched = matcher.matching_rules(&view_event()).await;

        assert_eq!(
            ids(&matched),
            vec!["site-a_profile-0", "site-a_profile-1", "site-a_profile-2"]
        );
    }

    #[tokio::test]
    async fn test_profile_dedup_takes_precedence() {
        let mut history = MockEventHistory::new();
        history
            .expect_has_event_already_been_raised()
            .withf(|_, session_scope| !*session_scope)
            .times(1)
            .returning(|_, _| Ok(false));

        let mut both = rule("site-a", "both", event_type("view"));
        both.raise_event_only_once_for_profile = true;
        both.raise_event_only_once_for_session = true;
        let matcher = matcher_with(vec![both], history).await;

        assert_eq!(matcher.matching_rules(&view_event()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_rule() {
        let mut history = MockEventHistory::new();
        history
            .expect_has_event_already_been_raised()
            .returning(|_, _| Err(RuleError::Persistence("history unavailable".to_string())));

        let ambiguous = rule(
            "site-a",
            "ambiguous",
            json!({
                "parameterValues": {
                    "operator": "or",
                    "subConditions": [event_type("view"), profile_age_over(18)]
                }
            }),
        );
        let mut oracle_failure = rule("site-a", "oracle", event_type("view"));
        oracle_failure.raise_event_only_once_for_session = true;
        let healthy = rule("site-a", "healthy", event_type("view"));

        let matcher = matcher_with(vec![ambiguous, oracle_failure, healthy], history).await;

        assert_eq!(
            ids(&matcher.matching_rules(&view_event()).await),
            vec!["site-a_healthy"]
        );
    }

    #[tokio::test]
    async fn test_skips_flagged_and_unresolved_rules() {
        let mut missing = rule("site-a", "missing", event_type("view"));
        missing.metadata.missing_plugins = true;
        let mut disabled = rule("site-a", "disabled", event_type("view"));
        disabled.metadata.enabled = false;
        let unresolved = rule(
            "site-a",
            "geo",
            json!({
                "parameterValues": {
                    "operator": "and",
                    "subConditions": [
                        event_type("view"),
                        { "conditionTypeId": "geoCondition", "parameterValues": {} }
                    ]
                }
            }),
        );
        let healthy = rule("site-a", "healthy", event_type("view"));

        let matcher = matcher_with(
            vec![missing, disabled, unresolved, healthy],
            MockEventHistory::new(),
        )
        .await;

        assert_eq!(
            ids(&matcher.matching_rules(&view_event()).await),
            vec!["site-a_healthy"]
        );
    }

    #[tokio::test]
    async fn test_unresolved_leaf_excluded_when_check_disabled() {
        // 关闭防御性跳过后，未解析的叶子仍然不会被任何阶段提取
        let unresolved = rule(
            "site-a",
            "geo",
            json!({
                "parameterValues": {
                    "operator": "and",
                    "subConditions": [
                        event_type("view"),
                        { "conditionTypeId": "geoCondition", "parameterValues": {} }
                    ]
                }
            }),
        );
        let catalog = RuleCatalog::new(
            Arc::new(InMemoryRulePersistence::with_rules(vec![unresolved])),
            Arc::new(registry()),
        );
        catalog.refresh().await.unwrap();
        let config = RuleEngineConfig {
            skip_unresolved: false,
            ..RuleEngineConfig::default()
        };
        let matcher = RuleMatcher::new(catalog, Arc::new(MockEventHistory::new()), config);

        assert_eq!(matcher.matching_rules(&view_event()).await.len(), 1);
    }
}
