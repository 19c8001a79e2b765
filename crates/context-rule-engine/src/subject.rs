//! 条件匹配对象
//!
//! 持久化层的 `testMatch` 可以针对事件、档案、会话或任意条目求值，
//! [`Subject`] 统一借用这些对象并渲染为求值上下文。

use crate::models::{Event, Item, Profile, Session};
use serde_json::Value;

/// 被匹配的对象
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Event(&'a Event),
    Profile(&'a Profile),
    Session(&'a Session),
    Item(&'a Item),
}

impl Subject<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Profile(_) => "profile",
            Self::Session(_) => "session",
            Self::Item(_) => "item",
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Self::Event(e) => &e.item_id,
            Self::Profile(p) => &p.item_id,
            Self::Session(s) => &s.item_id,
            Self::Item(i) => &i.item_id,
        }
    }

    /// 渲染为求值上下文（字段名为 camelCase，与规则中的 propertyName 一致）
    pub fn to_evaluation_context(&self) -> serde_json::Result<EvaluationContext> {
        let data = match self {
            Self::Event(e) => serde_json::to_value(e)?,
            Self::Profile(p) => serde_json::to_value(p)?,
            Self::Session(s) => serde_json::to_value(s)?,
            Self::Item(i) => serde_json::to_value(i)?,
        };
        Ok(EvaluationContext::new(data))
    }
}

/// 求值上下文
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    data: Value,
}

impl EvaluationContext {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    /// 获取字段值（支持点号分隔的路径，如 "properties.age" 或 "profile.segments.0"）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.data;

        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}
