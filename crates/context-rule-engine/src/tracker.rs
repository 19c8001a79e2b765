//! 插件可用性跟踪
//!
//! 宿主进程在模块启动后、停止前调用跟踪器，跟踪器据此切换规则的
//! `missingPlugins` 标记：
//!
//! - 类型新增：所有标记为缺失插件的规则重新解析，全部类型可用时恢复
//! - 类型撤回：引用了被撤回类型（条件或动作）的规则被标记为缺失插件
//!
//! 每次切换都在该规则的写锁内重新读取并持久化，避免覆盖并发写入。

use crate::catalog::RuleCatalog;
use crate::error::Result;
use crate::extractor::condition_type_ids;
use crate::models::Rule;
use crate::ports::RuleQuery;
use crate::registry::ModuleTypes;
use context_shared::observability::metrics::RULE_AVAILABILITY_TRANSITIONS_TOTAL;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 插件可用性跟踪器
#[derive(Clone)]
pub struct PluginAvailabilityTracker {
    catalog: RuleCatalog,
}

impl PluginAvailabilityTracker {
    pub fn new(catalog: RuleCatalog) -> Self {
        Self { catalog }
    }

    /// 模块启动后调用
    pub async fn on_module_started(&self, module_id: &str) -> Result<Vec<String>> {
        let types = self.catalog.registry().types_by_module(module_id);
        self.on_types_added(module_id, &types).await
    }

    /// 模块停止前调用（此时注册表仍能查询到该模块的类型）
    pub async fn on_module_stopping(&self, module_id: &str) -> Result<Vec<String>> {
        let types = self.catalog.registry().types_by_module(module_id);
        self.on_types_removed(module_id, &types).await
    }

    /// 类型新增：恢复已能完全解析的缺失插件规则，返回被恢复的规则
    #[instrument(skip(self, types), fields(
        condition_types = types.condition_type_ids.len(),
        action_types = types.action_type_ids.len()
    ))]
    pub async fn on_types_added(&self, module_id: &str, types: &ModuleTypes) -> Result<Vec<String>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .catalog
            .persistence()
            .query_rules(&RuleQuery::MissingPlugins(true))
            .await?;

        let mut enabled = Vec::new();
        for candidate in candidates {
            let key = candidate.item_id();
            match self.try_enable(&key).await {
                Ok(true) => enabled.push(key),
                Ok(false) => {}
                Err(e) => warn!(rule_id = %key, error = %e, "恢复规则失败"),
            }
        }

        if !enabled.is_empty() {
            info!("模块 {} 启动，已恢复 {} 条规则", module_id, enabled.len());
        }
        Ok(enabled)
    }

    /// 类型撤回：停用引用了这些类型的规则，返回被停用的规则
    #[instrument(skip(self, types), fields(
        condition_types = types.condition_type_ids.len(),
        action_types = types.action_type_ids.len()
    ))]
    pub async fn on_types_removed(
        &self,
        module_id: &str,
        types: &ModuleTypes,
    ) -> Result<Vec<String>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }

        let rules = self.catalog.persistence().all_rules().await?;

        let mut disabled = Vec::new();
        for rule in rules {
            if rule.metadata.missing_plugins || !references_any(&rule, types) {
                continue;
            }
            let key = rule.item_id();
            match self.try_disable(&key, types).await {
                Ok(true) => disabled.push(key),
                Ok(false) => {}
                Err(e) => warn!(rule_id = %key, error = %e, "停用规则失败"),
            }
        }

        if !disabled.is_empty() {
            info!("模块 {} 停止，已停用 {} 条规则", module_id, disabled.len());
        }
        Ok(disabled)
    }

    async fn try_enable(&self, key: &str) -> Result<bool> {
        let _guard = self.catalog.lock(key).await;

        let Some(rule) = self.catalog.load(key).await? else {
            return Ok(false);
        };
        if !rule.metadata.missing_plugins {
            return Ok(false);
        }

        let resolved = Arc::new(rule).resolved(self.catalog.registry().as_ref());
        if !resolved.is_fully_resolved() {
            return Ok(false);
        }

        let mut rule = Rule::clone(&resolved);
        rule.metadata.missing_plugins = false;
        self.catalog.persist(rule).await?;

        metrics::counter!(RULE_AVAILABILITY_TRANSITIONS_TOTAL, "transition" => "enabled")
            .increment(1);
        info!(rule_id = %key, "规则依赖的插件已全部可用，规则已恢复");
        Ok(true)
    }

    async fn try_disable(&self, key: &str, types: &ModuleTypes) -> Result<bool> {
        let _guard = self.catalog.lock(key).await;

        let Some(mut rule) = self.catalog.load(key).await? else {
            return Ok(false);
        };
        if rule.metadata.missing_plugins || !references_any(&rule, types) {
            return Ok(false);
        }

        rule.metadata.missing_plugins = true;
        self.catalog.persist(rule).await?;

        metrics::counter!(RULE_AVAILABILITY_TRANSITIONS_TOTAL, "transition" => "disabled")
            .increment(1);
        warn!(rule_id = %key, "规则依赖的插件被撤回，规则已停用");
        Ok(true)
    }
}

/// 规则是否引用了给定的任一条件或动作类型
fn references_any(rule: &Rule, types: &ModuleTypes) -> bool {
    let uses_condition = condition_type_ids(&rule.condition)
        .iter()
        .any(|id| types.condition_type_ids.contains(id));
    let uses_action = rule
        .actions
        .iter()
        .any(|action| types.action_type_ids.contains(&action.action_type_id));
    uses_condition || uses_action
}
