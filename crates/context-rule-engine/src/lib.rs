//! 上下文规则引擎
//!
//! 将行为事件与声明式规则目录进行匹配，支持：
//! - 条件树模型与运行时类型解析
//! - 按标签提取事件/档案/会话阶段的条件子树
//! - 带去重的规则匹配与动作分发
//! - 随插件类型增减自动停用/恢复规则

pub mod catalog;
pub mod condition;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod extractor;
pub mod loader;
pub mod matcher;
pub mod memory;
pub mod models;
pub mod operators;
pub mod ports;
pub mod registry;
pub mod service;
pub mod subject;
pub mod tracker;
pub mod validator;

pub use catalog::RuleCatalog;
pub use condition::{resolve, tags, CompositeCondition, Condition, LeafCondition};
pub use error::{Result, RuleError};
pub use extractor::{condition_type_ids, extract_all_by_type, extract_by_tag};
pub use models::{Action, Event, Item, ItemRef, Metadata, Profile, Rule, Session};
pub use operators::{ComparisonOperator, LogicalOperator};
pub use ports::{ActionExecutor, EventBus, EventHistory, RulePersistence, RuleQuery};
pub use registry::{ActionType, ConditionType, ModuleTypes, Resolution, TypeRegistry};
pub use service::{Collaborators, RulesService};
pub use subject::Subject;
pub use tracker::PluginAvailabilityTracker;
