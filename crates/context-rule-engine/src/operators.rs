//! 条件操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RuleError;

/// 属性比较操作符
///
/// 命名与规则定义中 `comparisonOperator` 参数的取值一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    // 通用比较
    Equals,
    NotEquals,

    // 数值/时间比较
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    Between,

    // 存在性
    Exists,
    Missing,

    // 字符串操作
    Contains,
    StartsWith,
    EndsWith,
    MatchesRegex,

    // 集合操作
    In,
    NotIn,
    All,
    HasSomeOf,
    HasNoneOf,
}

impl ComparisonOperator {
    /// 操作符是否需要列表形式的期望值（propertyValues）
    pub fn expects_list(&self) -> bool {
        matches!(
            self,
            Self::Between | Self::In | Self::NotIn | Self::All | Self::HasSomeOf | Self::HasNoneOf
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "notEquals",
            Self::GreaterThan => "greaterThan",
            Self::GreaterThanOrEqualTo => "greaterThanOrEqualTo",
            Self::LessThan => "lessThan",
            Self::LessThanOrEqualTo => "lessThanOrEqualTo",
            Self::Between => "between",
            Self::Exists => "exists",
            Self::Missing => "missing",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::MatchesRegex => "matchesRegex",
            Self::In => "in",
            Self::NotIn => "notIn",
            Self::All => "all",
            Self::HasSomeOf => "hasSomeOf",
            Self::HasNoneOf => "hasNoneOf",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComparisonOperator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| RuleError::InvalidOperator(s.to_string()))
    }
}

/// 组合条件的逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogicalOperator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(RuleError::InvalidOperator(other.to_string())),
        }
    }
}
