//! 规则引擎演示进程
//!
//! 从标准输入逐行读取 JSON 事件，执行规则匹配与动作分发，
//! 并将发布的 ruleFired 事件回送引擎继续匹配。

use anyhow::Result;
use context_shared::config::AppConfig;
use context_shared::observability;
use rule_engine::loader::{load_module_definitions, load_predefined_rules};
use rule_engine::memory::{
    ChannelEventBus, InMemoryEventHistory, InMemoryRulePersistence, InMemoryTypeRegistry,
    RecordingActionExecutor,
};
use rule_engine::{Collaborators, Event, RulesService};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 统一加载配置：从 config/{service_name}.toml 加载，包含可观测性配置
    let config = AppConfig::load("rule-engine").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    info!("Starting rule-engine ({})...", config.environment);

    let registry = Arc::new(InMemoryTypeRegistry::new());
    let modules = load_module_definitions(&registry, &config.rules.definitions_dir).await?;

    let history = Arc::new(InMemoryEventHistory::new());
    let (bus, mut fired) = ChannelEventBus::new();
    let service = RulesService::new(
        Collaborators {
            registry: registry.clone(),
            persistence: Arc::new(InMemoryRulePersistence::new()),
            history: history.clone(),
            executor: Arc::new(RecordingActionExecutor::new()),
            bus: Arc::new(bus),
        },
        config.engine.clone(),
    );

    service.refresh_catalog().await?;
    let loaded = load_predefined_rules(&service, &config.rules.predefined_dir).await?;
    info!("Loaded {} predefined rules", loaded);

    for module_id in &modules {
        let enabled = service
            .availability_tracker()
            .on_module_started(module_id)
            .await?;
        if !enabled.is_empty() {
            info!(module_id = %module_id, "Re-enabled rules: {:?}", enabled);
        }
    }

    info!("Reading events from stdin, one JSON document per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("End of input reached");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => process(&service, &history, &mut fired, event).await,
                    Err(e) => warn!(error = %e, "Failed to parse event, skipped"),
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 处理一个外部事件及其派生的 ruleFired 事件
async fn process(
    service: &RulesService,
    history: &InMemoryEventHistory,
    fired: &mut UnboundedReceiver<Event>,
    event: Event,
) {
    let mut queue = VecDeque::from([event]);

    while let Some(event) = queue.pop_front() {
        let changed = service.on_event(&event).await;
        history.record(&event);

        info!(
            event_id = %event.item_id,
            event_type = %event.event_type,
            depth = event.derivation_depth,
            changed,
            "Event processed"
        );

        while let Ok(derived) = fired.try_recv() {
            queue.push_back(derived);
        }
    }
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
