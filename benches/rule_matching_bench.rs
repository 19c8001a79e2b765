//! 规则匹配性能基准测试
//!
//! 测试覆盖：
//! - 按标签提取条件子树（整树命中、部分命中、嵌套）
//! - 条件树类型解析（首次解析与无变化的重复解析）
//! - 不同规则数量下的单事件匹配

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rule_engine::memory::{
    ChannelEventBus, InMemoryEventHistory, InMemoryRulePersistence, InMemoryTypeRegistry,
    RecordingActionExecutor,
};
use rule_engine::{
    extract_by_tag, resolve, tags, Collaborators, Condition, ConditionType, Event, Profile, Rule,
    RulesService,
};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn create_registry() -> InMemoryTypeRegistry {
    let registry = InMemoryTypeRegistry::new();
    registry.register_module(
        "core",
        vec![
            ConditionType::new("eventTypeCondition", [tags::EVENT_CONDITION]),
            ConditionType::new("eventPropertyCondition", [tags::EVENT_CONDITION]),
            ConditionType::new("profilePropertyCondition", [tags::PROFILE_CONDITION]),
        ],
        vec![],
    );
    registry
}

fn event_leaf(i: usize) -> serde_json::Value {
    json!({
        "conditionTypeId": "eventPropertyCondition",
        "parameterValues": { "propertyName": format!("properties.field_{}", i), "propertyValue": i }
    })
}

fn profile_leaf(i: usize) -> serde_json::Value {
    json!({
        "conditionTypeId": "profilePropertyCondition",
        "parameterValues": { "propertyName": format!("properties.field_{}", i), "propertyValue": i }
    })
}

/// 创建 and 组合条件，事件叶子与档案叶子交替出现
fn create_mixed_tree(leaves: usize) -> Condition {
    let sub_conditions: Vec<_> = (0..leaves)
        .map(|i| if i % 2 == 0 { event_leaf(i) } else { profile_leaf(i) })
        .collect();
    serde_json::from_value(json!({
        "parameterValues": { "operator": "and", "subConditions": sub_conditions }
    }))
    .unwrap()
}

/// 创建嵌套的 and 组合条件
fn create_nested_tree(depth: usize, breadth: usize) -> serde_json::Value {
    if depth == 0 {
        return event_leaf(breadth);
    }
    let children: Vec<_> = (0..breadth)
        .map(|i| {
            if i == 0 {
                profile_leaf(i)
            } else {
                create_nested_tree(depth - 1, breadth)
            }
        })
        .collect();
    json!({ "parameterValues": { "operator": "and", "subConditions": children } })
}

fn create_rule(i: usize) -> Rule {
    serde_json::from_value(json!({
        "metadata": { "id": format!("rule-{}", i), "scope": "site-a" },
        "condition": {
            "parameterValues": {
                "operator": "and",
                "subConditions": [
                    { "conditionTypeId": "eventTypeCondition", "parameterValues": { "eventTypeId": if i % 2 == 0 { "view" } else { "purchase" } } },
                    {
                        "conditionTypeId": "profilePropertyCondition",
                        "parameterValues": {
                            "propertyName": "properties.age",
                            "comparisonOperator": "greaterThan",
                            "propertyValue": i % 50
                        }
                    }
                ]
            }
        }
    }))
    .unwrap()
}

// ============================================================================
// 基准测试函数
// ============================================================================

/// 标签提取基准
fn bench_extraction(c: &mut Criterion) {
    let registry = create_registry();
    let mut group = c.benchmark_group("extract_by_tag");

    for leaves in [2, 10, 50].iter() {
        let tree = resolve(&Arc::new(create_mixed_tree(*leaves)), &registry);

        group.throughput(Throughput::Elements(*leaves as u64));
        group.bench_with_input(BenchmarkId::new("partial", leaves), leaves, |b, _| {
            b.iter(|| extract_by_tag(black_box(&tree), tags::EVENT_CONDITION))
        });
    }

    let full: Condition = serde_json::from_value(json!({
        "parameterValues": {
            "operator": "or",
            "subConditions": (0..10).map(event_leaf).collect::<Vec<_>>()
        }
    }))
    .unwrap();
    let full = resolve(&Arc::new(full), &registry);
    group.bench_function("full_match", |b| {
        b.iter(|| extract_by_tag(black_box(&full), tags::EVENT_CONDITION))
    });

    for (depth, breadth) in [(2, 3), (4, 3), (3, 5)].iter() {
        let nested: Condition = serde_json::from_value(create_nested_tree(*depth, *breadth)).unwrap();
        let nested = resolve(&Arc::new(nested), &registry);
        group.bench_with_input(
            BenchmarkId::new("nested", format!("{}x{}", depth, breadth)),
            &(depth, breadth),
            |b, _| b.iter(|| extract_by_tag(black_box(&nested), tags::PROFILE_CONDITION)),
        );
    }

    group.finish();
}

/// 类型解析基准
fn bench_resolution(c: &mut Criterion) {
    let registry = create_registry();
    let mut group = c.benchmark_group("resolve");

    let unresolved = Arc::new(create_mixed_tree(20));
    group.bench_function("first_pass", |b| {
        b.iter(|| resolve(black_box(&unresolved), &registry))
    });

    let resolved = resolve(&unresolved, &registry);
    group.bench_function("unchanged", |b| {
        b.iter(|| resolve(black_box(&resolved), &registry))
    });

    group.finish();
}

/// 单事件匹配基准（不同规则数量）
fn bench_matching(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("matching_rules");

    for rules_count in [10, 100, 1000].iter() {
        let (bus, _fired) = ChannelEventBus::new();
        let service = RulesService::new(
            Collaborators {
                registry: Arc::new(create_registry()),
                persistence: Arc::new(InMemoryRulePersistence::with_rules(
                    (0..*rules_count).map(create_rule).collect(),
                )),
                history: Arc::new(InMemoryEventHistory::new()),
                executor: Arc::new(RecordingActionExecutor::new()),
                bus: Arc::new(bus),
            },
            Default::default(),
        );
        runtime.block_on(service.refresh_catalog()).unwrap();

        let event = Event::new("view", "site-a")
            .with_profile(Profile::new("p1").with_property("age", 30));

        group.throughput(Throughput::Elements(*rules_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(rules_count),
            rules_count,
            |b, _| {
                b.iter(|| runtime.block_on(service.get_matching_rules(black_box(&event))))
            },
        );
    }

    group.finish();
}

// 配置 criterion
criterion_group!(benches, bench_extraction, bench_resolution, bench_matching);

criterion_main!(benches);
