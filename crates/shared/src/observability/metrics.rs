//! 指标描述模块
//!
//! 基于 metrics facade 注册规则引擎使用的指标。未安装 recorder 时所有指标调用均为空操作。

/// 规则匹配计数
pub const RULE_MATCHES_TOTAL: &str = "rule_matches_total";
/// 单条规则评估失败计数（标签提取歧义、匹配预言失败等）
pub const RULE_EVALUATION_FAILURES_TOTAL: &str = "rule_evaluation_failures_total";
/// 已发布的 ruleFired 派生事件计数
pub const RULE_FIRED_EVENTS_TOTAL: &str = "rule_fired_events_total";
/// 插件可用性状态切换计数，标签 transition=enabled|disabled
pub const RULE_AVAILABILITY_TRANSITIONS_TOTAL: &str = "rule_availability_transitions_total";
/// 单个事件的规则匹配耗时
pub const RULE_MATCHING_DURATION_SECONDS: &str = "rule_matching_duration_seconds";

/// 注册指标描述
pub fn describe() {
    metrics::describe_counter!(RULE_MATCHES_TOTAL, "Total number of rules matched by events");
    metrics::describe_counter!(
        RULE_EVALUATION_FAILURES_TOTAL,
        "Total number of per-rule evaluation failures"
    );
    metrics::describe_counter!(
        RULE_FIRED_EVENTS_TOTAL,
        "Total number of ruleFired events published"
    );
    metrics::describe_counter!(
        RULE_AVAILABILITY_TRANSITIONS_TOTAL,
        "Total number of rule enable/disable transitions caused by plugin availability"
    );
    metrics::describe_histogram!(
        RULE_MATCHING_DURATION_SECONDS,
        "Rule matching duration per event in seconds"
    );
}
