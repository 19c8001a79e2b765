//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("标签提取歧义: 标签 '{tag}' 在 {operator} 组合条件下仅部分匹配")]
    AmbiguousExtraction { tag: String, operator: String },

    #[error("无效的规则: {0}")]
    InvalidRule(String),

    #[error("无效的条件: {0}")]
    InvalidCondition(String),

    #[error("无效的操作符: {0}")]
    InvalidOperator(String),

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("动作执行失败: action_type={action_type_id} - {message}")]
    ActionExecution {
        action_type_id: String,
        message: String,
    },

    #[error("事件发布失败: {0}")]
    Publish(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::AmbiguousExtraction { .. } => "AMBIGUOUS_EXTRACTION",
            Self::InvalidRule(_) => "INVALID_RULE",
            Self::InvalidCondition(_) => "INVALID_CONDITION",
            Self::InvalidOperator(_) => "INVALID_OPERATOR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::ActionExecution { .. } => "ACTION_EXECUTION_ERROR",
            Self::Publish(_) => "PUBLISH_ERROR",
            Self::JsonError(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 引擎内部从不重试，该标记供外部协作方（持久化层、事件总线）决定重试策略。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Publish(_) | Self::Io(_))
    }
}
