//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::observability::ObservabilityConfig;

/// 规则引擎行为配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleEngineConfig {
    /// 匹配时跳过被标记为缺失插件的规则
    pub skip_missing_plugins: bool,
    /// 匹配时跳过 enabled=false 的规则
    pub skip_disabled: bool,
    /// 匹配时跳过条件树或动作未完全解析的规则
    pub skip_unresolved: bool,
    /// ruleFired 派生事件允许的最大嵌套深度，0 表示不限制
    pub max_rule_fired_depth: u32,
    /// setRule 时是否校验规则结构与标签提取歧义
    pub validate_on_write: bool,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            skip_missing_plugins: true,
            skip_disabled: true,
            skip_unresolved: true,
            max_rule_fired_depth: 8,
            validate_on_write: true,
        }
    }
}

/// 规则与类型定义的加载位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 预定义规则目录（*.json）
    pub predefined_dir: PathBuf,
    /// 模块类型定义目录（每个 *.json 文件对应一个模块）
    pub definitions_dir: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            predefined_dir: PathBuf::from("config/rules"),
            definitions_dir: PathBuf::from("config/definitions"),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub engine: RuleEngineConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CONTEXT_ 前缀，双下划线分隔层级，如 CONTEXT_ENGINE__MAX_RULE_FIRED_DEPTH）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CONTEXT_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("CONTEXT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.engine.skip_missing_plugins);
        assert!(config.engine.validate_on_write);
        assert_eq!(config.engine.max_rule_fired_depth, 8);
        assert_eq!(config.rules.predefined_dir, PathBuf::from("config/rules"));
    }

    #[test]
    fn test_partial_engine_section_keeps_defaults() {
        let config: AppConfig = Config::builder()
            .set_default("service_name", "rule-engine")
            .unwrap()
            .set_default("environment", "test")
            .unwrap()
            .set_override("engine.max_rule_fired_depth", 2)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.engine.max_rule_fired_depth, 2);
        assert!(config.engine.skip_disabled);
        assert!(!config.is_production());
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let config = AppConfig::load("rule-engine-config-test").unwrap();
        assert_eq!(config.service_name, "rule-engine-config-test");
        assert!(config.engine.skip_unresolved);
    }
}
