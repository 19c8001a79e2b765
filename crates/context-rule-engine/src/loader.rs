//! 预定义规则与模块类型定义加载
//!
//! 目录中每个 `*.json` 文件是一条规则或一个模块的类型定义。单个文件读取或解析失败
//! 只记录日志并跳过，不影响其余文件。

use crate::error::Result;
use crate::memory::InMemoryTypeRegistry;
use crate::models::Rule;
use crate::registry::{ActionType, ConditionType};
use crate::service::RulesService;
use crate::validator::RuleValidator;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 模块类型定义文件
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefinition {
    #[serde(default)]
    pub condition_types: Vec<ConditionType>,
    #[serde(default)]
    pub action_types: Vec<ActionType>,
}

/// 按文件名排序列出目录中的 json 文件，目录不存在时返回空列表
async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !tokio::fs::try_exists(dir).await? {
        warn!("目录不存在，跳过加载: {}", dir.display());
        return Ok(Vec::new());
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// 加载模块类型定义，模块 id 取文件名（不含扩展名），返回已登记的模块 id
#[instrument(skip(registry))]
pub async fn load_module_definitions(
    registry: &InMemoryTypeRegistry,
    dir: &Path,
) -> Result<Vec<String>> {
    let mut modules = Vec::new();

    for path in json_files(dir).await? {
        let Some(module_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let definition = match read_json::<ModuleDefinition>(&path).await {
            Ok(definition) => definition,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "模块定义加载失败，已跳过");
                continue;
            }
        };

        registry.register_module(module_id, definition.condition_types, definition.action_types);
        modules.push(module_id.to_string());
    }

    info!("已加载 {} 个模块定义", modules.len());
    Ok(modules)
}

/// 加载预定义规则，返回新写入的规则数
///
/// 未指定作用域的规则归入 systemscope；目录中已存在的规则不会被覆盖；
/// 加载时无法完全解析的规则标记为缺失插件。
#[instrument(skip(service))]
pub async fn load_predefined_rules(service: &RulesService, dir: &Path) -> Result<usize> {
    let mut loaded = 0;

    for path in json_files(dir).await? {
        match load_rule_file(service, &path).await {
            Ok(true) => loaded += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "预定义规则加载失败，已跳过");
            }
        }
    }

    info!("已加载 {} 条预定义规则", loaded);
    Ok(loaded)
}

async fn load_rule_file(service: &RulesService, path: &Path) -> Result<bool> {
    let rule: Rule = read_json(path).await?;
    RuleValidator::validate(&rule)?;

    let catalog = service.catalog();
    let key = rule.item_id();
    let _guard = catalog.lock(&key).await;

    if catalog.load(&key).await?.is_some() {
        debug!(rule_id = %key, "规则已存在，跳过预定义版本");
        return Ok(false);
    }

    let resolved = Arc::new(rule).resolved(catalog.registry().as_ref());
    let mut rule = Rule::clone(&resolved);
    if !resolved.is_fully_resolved() {
        warn!(rule_id = %key, "规则依赖的插件不可用，标记为缺失插件");
        rule.metadata.missing_plugins = true;
    } else if rule.metadata.enabled {
        RuleValidator::validate_extraction(&rule.condition)?;
    }

    catalog.persist(rule).await?;
    Ok(true)
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
