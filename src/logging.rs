//! 日志模块 - 控制台 + 按天滚动的文件日志

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 日志目录
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// 初始化日志系统
///
/// 返回的 guard 必须持有到进程结束，否则文件日志会丢失尾部。
pub fn init_logging(data_dir: &Path, config: &LogConfig) -> Option<WorkerGuard> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter(config))
            .with(console_layer)
            .try_init();
        return None;
    }

    let dir = log_dir(data_dir);
    if let Err(e) = fs::create_dir_all(&dir) {
        // 文件日志创建失败，回退到控制台
        let _ = tracing_subscriber::registry()
            .with(env_filter(config))
            .with(console_layer)
            .try_init();
        tracing::warn!("无法创建日志目录 {:?}: {}", dir, e);
        return None;
    }

    let (file_writer, guard) =
        tracing_appender::non_blocking(rolling::daily(&dir, "drivemirror.log"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Some(guard)
}

/// 创建数据目录并按其中的 config.json 初始化日志
///
/// 数据目录无法创建时只输出到控制台，并在日志初始化后记录警告。
pub fn init_for_data_dir(data_dir: &Path) -> Option<WorkerGuard> {
    let created = fs::create_dir_all(data_dir);
    let config = LogConfig::load(data_dir);
    let guard = init_logging(data_dir, &config);
    if let Err(e) = created {
        tracing::warn!("无法创建数据目录 {:?}: {}", data_dir, e);
    }
    guard
}
