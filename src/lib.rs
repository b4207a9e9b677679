use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod auth;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod registry;
pub mod storage;

pub use config::{AppConfig, Cli, Command};
pub use core::{RunReport, TransferOrchestrator};

use auth::{CredentialProvider, OAuthCredentials, StaticCredentials, Tenant};
use config::BackendConfig;
use core::{
    AuditLog, OrchestratorConfig, RetryExecutor, RetryPolicy, SystemClock, TokioSleeper,
};
use registry::{create_registry, Registry};
use storage::{create_directories, Directories};

/// 一次运行共享的依赖
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub directories: Directories,
    pub registry: Arc<dyn Registry>,
    pub executor: Arc<RetryExecutor>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("无法创建数据目录 {:?}", config.data_dir))?;

        // 上传可能持续很久，只限制建立连接的时间
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("drivemirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("创建 HTTP 客户端失败")?;

        let credentials: Arc<dyn CredentialProvider> = match &config.backend {
            BackendConfig::WorkDrive(wd) => {
                let clients = HashMap::from([
                    (Tenant::Source, wd.source.clone()),
                    (Tenant::Destination, wd.destination.clone()),
                ]);
                Arc::new(OAuthCredentials::new(http.clone(), &wd.token_url, clients))
            }
            BackendConfig::Local(_) => Arc::new(StaticCredentials::default()),
        };

        let directories = create_directories(&config, &http, credentials.clone())?;
        let registry = create_registry(&config, &http, credentials.clone())?;
        let executor = Arc::new(RetryExecutor::new(
            RetryPolicy::from_config(&config.transfer),
            Arc::new(TokioSleeper),
            credentials.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            credentials,
            directories,
            registry,
            executor,
        })
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.config.data_dir.join("audit")
    }

    /// 按配置组装编排器，审计写入 `<data-dir>/audit`
    pub fn orchestrator(&self) -> anyhow::Result<TransferOrchestrator> {
        let config = &self.config;
        let clock = Arc::new(SystemClock);
        let audit = AuditLog::new(&self.audit_dir(), clock.clone())
            .with_context(|| format!("无法创建审计目录 {:?}", self.audit_dir()))?;

        let orchestrator = TransferOrchestrator::new(
            self.registry.clone(),
            &self.directories,
            self.executor.clone(),
            clock,
            OrchestratorConfig {
                scope_root_id: config.scope_root_id.clone(),
                dest_root_id: config.dest_root_id.clone(),
                max_concurrent_transfers: config.transfer.max_concurrent_transfers,
                nest_under_folder_name: config.transfer.nest_under_folder_name,
                dry_run: config.dry_run,
            },
        );
        Ok(orchestrator.with_audit(audit))
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
