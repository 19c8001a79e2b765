//! 外部协作方接口
//!
//! 引擎只依赖这些抽象：持久化/查询层、事件历史、动作执行器与事件总线，
//! 便于服务层依赖抽象而非具体实现，支持 mock 测试。

use async_trait::async_trait;

use crate::condition::Condition;
use crate::error::Result;
use crate::models::{Action, Event, Rule};
use crate::subject::Subject;

/// 按元数据字段查询规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleQuery {
    Scope(String),
    MissingPlugins(bool),
    Enabled(bool),
}

impl RuleQuery {
    pub fn matches(&self, rule: &Rule) -> bool {
        match self {
            Self::Scope(scope) => rule.metadata.scope == *scope,
            Self::MissingPlugins(flag) => rule.metadata.missing_plugins == *flag,
            Self::Enabled(flag) => rule.metadata.enabled == *flag,
        }
    }
}

/// 持久化/查询层接口
///
/// 规则以 `scope_id` 作为主键。重试策略属于实现方，引擎不做内部重试。
#[async_trait]
pub trait RulePersistence: Send + Sync {
    /// 条件树对事件、档案、会话或任意条目的模式匹配
    async fn test_match(&self, condition: &Condition, subject: Subject<'_>) -> Result<bool>;

    async fn all_rules(&self) -> Result<Vec<Rule>>;

    async fn load(&self, id_with_scope: &str) -> Result<Option<Rule>>;

    async fn save(&self, rule: &Rule) -> Result<()>;

    /// 返回是否确实删除了规则
    async fn remove(&self, id_with_scope: &str) -> Result<bool>;

    async fn query_rules(&self, query: &RuleQuery) -> Result<Vec<Rule>>;
}

/// 事件历史接口（去重判定）
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHistory: Send + Sync {
    /// 等价事件是否已在当前档案（`session_scope` 为 true 时为当前会话）中触发过
    async fn has_event_already_been_raised(&self, event: &Event, session_scope: bool)
    -> Result<bool>;
}

/// 动作执行器接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 执行动作，返回是否改变了状态
    async fn execute(&self, action: &Action, event: &Event) -> Result<bool>;
}

/// 事件总线接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use serde_json::Map;

    #[test]
    fn test_rule_query_matches() {
        let mut rule = Rule::new(
            Metadata::new("site-a", "r1"),
            Condition::leaf("eventTypeCondition", Map::new()),
        );
        rule.metadata.missing_plugins = true;

        assert!(RuleQuery::Scope("site-a".to_string()).matches(&rule));
        assert!(!RuleQuery::Scope("site-b".to_string()).matches(&rule));
        assert!(RuleQuery::MissingPlugins(true).matches(&rule));
        assert!(RuleQuery::Enabled(true).matches(&rule));
        assert!(!RuleQuery::Enabled(false).matches(&rule));
    }
}
