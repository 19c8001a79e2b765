//! 属性比较求值
//!
//! 实现 `comparisonOperator` 的求值语义，供内存持久化层的 `testMatch` 使用。
//! 多值属性（数组）按“任一元素满足”处理。

use crate::error::{Result, RuleError};
use crate::operators::ComparisonOperator;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::LazyLock;

/// 正则缓存容量上限，达到上限时整体清空后重新缓存
const REGEX_CACHE_CAPACITY: usize = 1024;

/// 已编译的正则表达式缓存
static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// 属性比较求值器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估比较
    ///
    /// # Arguments
    /// * `field_value` - 从上下文中获取的属性值
    /// * `operator` - 比较操作符
    /// * `expected_value` - 规则中定义的期望值（列表类操作符为数组）
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: ComparisonOperator,
        expected_value: &Value,
    ) -> Result<bool> {
        let field_value = field_value.filter(|v| !v.is_null());

        // 属性不存在时只有否定语义的操作符成立
        let Some(field) = field_value else {
            return Ok(matches!(
                operator,
                ComparisonOperator::Missing
                    | ComparisonOperator::NotEquals
                    | ComparisonOperator::NotIn
                    | ComparisonOperator::HasNoneOf
            ));
        };

        match operator {
            ComparisonOperator::Exists => Ok(true),
            ComparisonOperator::Missing => Ok(false),
            ComparisonOperator::Equals => Self::any_value(field, |v| Ok(Self::eq(v, expected_value))),
            ComparisonOperator::NotEquals => {
                Self::any_value(field, |v| Ok(Self::eq(v, expected_value))).map(|r| !r)
            }
            ComparisonOperator::GreaterThan => {
                Self::compare(field, expected_value, Ordering::is_gt)
            }
            ComparisonOperator::GreaterThanOrEqualTo => {
                Self::compare(field, expected_value, Ordering::is_ge)
            }
            ComparisonOperator::LessThan => Self::compare(field, expected_value, Ordering::is_lt),
            ComparisonOperator::LessThanOrEqualTo => {
                Self::compare(field, expected_value, Ordering::is_le)
            }
            ComparisonOperator::Between => Self::between(field, expected_value),
            ComparisonOperator::Contains => Self::contains(field, expected_value),
            ComparisonOperator::StartsWith => {
                Self::any_string(field, expected_value, |s, p| s.starts_with(p))
            }
            ComparisonOperator::EndsWith => {
                Self::any_string(field, expected_value, |s, p| s.ends_with(p))
            }
            ComparisonOperator::MatchesRegex => Self::regex_match(field, expected_value),
            ComparisonOperator::In | ComparisonOperator::HasSomeOf => {
                Self::has_some_of(field, expected_value)
            }
            ComparisonOperator::NotIn | ComparisonOperator::HasNoneOf => {
                Self::has_some_of(field, expected_value).map(|r| !r)
            }
            ComparisonOperator::All => Self::all(field, expected_value),
        }
    }

    /// 对多值属性逐个求值，任一元素满足即成立
    fn any_value<F>(field: &Value, mut f: F) -> Result<bool>
    where
        F: FnMut(&Value) -> Result<bool>,
    {
        match field {
            Value::Array(arr) => {
                for item in arr {
                    if f(item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => f(other),
        }
    }

    /// 相等比较
    fn eq(field: &Value, expected: &Value) -> bool {
        // 数值统一转为浮点数比较，避免 100 与 100.0 不相等
        if let (Some(f1), Some(f2)) = (Self::as_f64(field), Self::as_f64(expected)) {
            return (f1 - f2).abs() < f64::EPSILON;
        }
        field == expected
    }

    /// 有序比较：优先数值，其次日期时间
    fn ordering(field: &Value, expected: &Value) -> Result<Ordering> {
        if let (Some(a), Some(b)) = (Self::as_f64(field), Self::as_f64(expected)) {
            return a.partial_cmp(&b).ok_or_else(|| RuleError::TypeMismatch {
                expected: "comparable number".to_string(),
                actual: "NaN".to_string(),
            });
        }

        let a = Self::parse_datetime(field)?;
        let b = Self::parse_datetime(expected)?;
        Ok(a.cmp(&b))
    }

    fn compare<F>(field: &Value, expected: &Value, accept: F) -> Result<bool>
    where
        F: Fn(Ordering) -> bool,
    {
        Self::any_value(field, |v| Ok(accept(Self::ordering(v, expected)?)))
    }

    /// 范围比较，expected 为 [min, max]
    fn between(field: &Value, expected: &Value) -> Result<bool> {
        let bounds = Self::expect_array(expected)?;
        let [min, max] = bounds else {
            return Err(RuleError::InvalidCondition(format!(
                "between 需要 [min, max] 两个元素，当前有 {} 个",
                bounds.len()
            )));
        };

        Self::any_value(field, |v| {
            Ok(Self::ordering(v, min)?.is_ge() && Self::ordering(v, max)?.is_le())
        })
    }

    /// 字符串包含子串，或数组包含元素
    fn contains(field: &Value, expected: &Value) -> Result<bool> {
        match field {
            Value::String(s) => {
                let substr = Self::expect_str(expected)?;
                Ok(s.contains(substr))
            }
            Value::Array(arr) => Ok(arr.iter().any(|item| Self::eq(item, expected))),
            other => Err(RuleError::TypeMismatch {
                expected: "string or array".to_string(),
                actual: Self::type_name(other).to_string(),
            }),
        }
    }

    fn any_string<F>(field: &Value, expected: &Value, f: F) -> Result<bool>
    where
        F: Fn(&str, &str) -> bool,
    {
        let pattern = Self::expect_str(expected)?;
        Self::any_value(field, |v| Ok(f(Self::expect_str(v)?, pattern)))
    }

    /// 正则匹配，编译结果按模式缓存
    fn regex_match(field: &Value, expected: &Value) -> Result<bool> {
        let pattern = Self::expect_str(expected)?;

        let regex = match REGEX_CACHE.get(pattern) {
            Some(cached) => cached.clone(),
            None => {
                let compiled = Regex::new(pattern).map_err(|e| {
                    RuleError::InvalidCondition(format!("无效的正则表达式 '{}': {}", pattern, e))
                })?;
                if REGEX_CACHE.len() >= REGEX_CACHE_CAPACITY {
                    REGEX_CACHE.clear();
                }
                REGEX_CACHE.insert(pattern.to_string(), compiled.clone());
                compiled
            }
        };

        Self::any_value(field, |v| Ok(regex.is_match(Self::expect_str(v)?)))
    }

    /// 属性（单值或多值）与期望列表存在交集
    fn has_some_of(field: &Value, expected: &Value) -> Result<bool> {
        let candidates = Self::expect_array(expected)?;
        Self::any_value(field, |v| Ok(candidates.iter().any(|c| Self::eq(v, c))))
    }

    /// 多值属性包含期望列表中的全部元素
    fn all(field: &Value, expected: &Value) -> Result<bool> {
        let required = Self::expect_array(expected)?;
        let values: &[Value] = match field {
            Value::Array(arr) => arr,
            other => std::slice::from_ref(other),
        };
        Ok(required
            .iter()
            .all(|r| values.iter().any(|v| Self::eq(v, r))))
    }

    /// 解析日期时间（RFC 3339 或 YYYY-MM-DD）
    fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
        let s = value.as_str().ok_or_else(|| RuleError::TypeMismatch {
            expected: "number or datetime string".to_string(),
            actual: Self::type_name(value).to_string(),
        })?;

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }

        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: "datetime string".to_string(),
                actual: format!("'{}'", s),
            })
    }

    fn expect_array(value: &Value) -> Result<&[Value]> {
        value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: "array".to_string(),
                actual: Self::type_name(value).to_string(),
            })
    }

    fn expect_str(value: &Value) -> Result<&str> {
        value.as_str().ok_or_else(|| RuleError::TypeMismatch {
            expected: "string".to_string(),
            actual: Self::type_name(value).to_string(),
        })
    }

    /// 尝试将 Value 转换为 f64
    fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}
