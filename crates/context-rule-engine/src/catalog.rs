//! 规则目录
//!
//! 匹配路径通过 `ArcSwap` 读取不可变快照，不阻塞写入；写入方（setRule、removeRule、
//! 插件可用性跟踪器）按 `scope_id` 持有异步互斥锁，同一规则的修改串行执行，
//! 不同规则可以并发修改。

use crate::error::Result;
use crate::models::Rule;
use crate::ports::RulePersistence;
use crate::registry::TypeRegistry;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

/// 规则快照
pub type RuleSnapshot = Arc<Vec<Arc<Rule>>>;

/// 规则目录
#[derive(Clone)]
pub struct RuleCatalog {
    persistence: Arc<dyn RulePersistence>,
    registry: Arc<dyn TypeRegistry>,
    snapshot: Arc<ArcSwap<Vec<Arc<Rule>>>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RuleCatalog {
    pub fn new(persistence: Arc<dyn RulePersistence>, registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            persistence,
            registry,
            snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn RulePersistence> {
        &self.persistence
    }

    pub fn registry(&self) -> &Arc<dyn TypeRegistry> {
        &self.registry
    }

    /// 当前快照，顺序与持久化层一致
    pub fn snapshot(&self) -> RuleSnapshot {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// 从快照中按 `scope_id` 查找规则
    pub fn get(&self, id_with_scope: &str) -> Option<Arc<Rule>> {
        self.snapshot
            .load()
            .iter()
            .find(|rule| rule.item_id() == id_with_scope)
            .cloned()
    }

    /// 从持久化层重建快照
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let rules: Vec<Arc<Rule>> = self
            .persistence
            .all_rules()
            .await?
            .into_iter()
            .map(|rule| Arc::new(rule).resolved(self.registry.as_ref()))
            .collect();

        let count = rules.len();
        self.snapshot.store(Arc::new(rules));

        info!("规则目录已刷新: {} 条规则", count);
        Ok(count)
    }

    /// 获取某条规则的写锁
    pub async fn lock(&self, id_with_scope: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id_with_scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// 从持久化层读取规则（调用方通常已持有该规则的写锁）
    pub async fn load(&self, id_with_scope: &str) -> Result<Option<Rule>> {
        self.persistence.load(id_with_scope).await
    }

    /// 持久化规则并更新快照
    ///
    /// 调用方必须已持有该规则的写锁。
    #[instrument(skip(self, rule), fields(rule_id = %rule.item_id()))]
    pub async fn persist(&self, rule: Rule) -> Result<Arc<Rule>> {
        self.persistence.save(&rule).await?;

        let key = rule.item_id();
        let rule = Arc::new(rule).resolved(self.registry.as_ref());

        self.snapshot.rcu(|current| {
            let mut rules = Vec::clone(current);
            match rules.iter_mut().find(|existing| existing.item_id() == key) {
                Some(existing) => *existing = Arc::clone(&rule),
                None => rules.push(Arc::clone(&rule)),
            }
            rules
        });

        info!("规则已保存: {}", key);
        Ok(rule)
    }

    /// 删除规则并更新快照
    ///
    /// 调用方必须已持有该规则的写锁。返回持久化层是否确实删除了规则。
    #[instrument(skip(self))]
    pub async fn delete(&self, id_with_scope: &str) -> Result<bool> {
        let removed = self.persistence.remove(id_with_scope).await?;

        self.snapshot.rcu(|current| {
            current
                .iter()
                .filter(|rule| rule.item_id() != id_with_scope)
                .cloned()
                .collect::<Vec<_>>()
        });

        if removed {
            info!("规则已删除: {}", id_with_scope);
        }
        Ok(removed)
    }
}
