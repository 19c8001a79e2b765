//! 动作分发
//!
//! 按声明顺序执行命中规则的动作，然后为该规则发布 ruleFired 派生事件。

use crate::models::{Event, Rule};
use crate::ports::{ActionExecutor, EventBus};
use context_shared::observability::metrics::RULE_FIRED_EVENTS_TOTAL;
use std::sync::Arc;
use tracing::{debug, warn};

/// 动作分发器
#[derive(Clone)]
pub struct ActionDispatcher {
    executor: Arc<dyn ActionExecutor>,
    bus: Arc<dyn EventBus>,
}

impl ActionDispatcher {
    pub fn new(executor: Arc<dyn ActionExecutor>, bus: Arc<dyn EventBus>) -> Self {
        Self { executor, bus }
    }

    /// 分发单条规则，返回是否有动作报告状态改变
    ///
    /// 动作失败记为“未改变”并继续执行后续动作；无论动作结果如何都会发布 ruleFired 事件。
    pub async fn dispatch(&self, rule: &Rule, event: &Event) -> bool {
        let rule_id = rule.item_id();
        let mut changed = false;

        for action in &rule.actions {
            match self.executor.execute(action, event).await {
                Ok(action_changed) => changed |= action_changed,
                Err(e) => {
                    warn!(
                        rule_id = %rule_id,
                        action_type_id = %action.action_type_id,
                        error = %e,
                        "动作执行失败"
                    );
                }
            }
        }

        let fired = event.rule_fired(rule);
        match self.bus.publish(fired).await {
            Ok(()) => {
                metrics::counter!(RULE_FIRED_EVENTS_TOTAL).increment(1);
                debug!(rule_id = %rule_id, changed, "ruleFired 事件已发布");
            }
            Err(e) => {
                warn!(rule_id = %rule_id, error = %e, "ruleFired 事件发布失败");
            }
        }

        changed
    }
}
