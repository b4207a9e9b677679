//! 应用配置模块
//!
//! 命令行参数和环境变量由 clap 解析（启动时先加载 `.env`），
//! 调优参数从数据目录下 `config.json` 的 `transfer` 段读取。

use crate::auth::OAuthClientConfig;
use crate::error::ConfigError;
use crate::registry::RecordFields;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 传输配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 每条记录内的最大并发传输数
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// 每次调用的总尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 重试延迟上限（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 列表分页大小
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 是否放在以源文件夹命名的子文件夹中
    #[serde(default)]
    pub nest_under_folder_name: bool,
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_page_size() -> usize {
    50
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            page_size: default_page_size(),
            nest_under_folder_name: false,
        }
    }
}

impl TransferConfig {
    /// 从配置文件加载传输配置
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("transfer").cloned())
            .and_then(|transfer| serde_json::from_value::<TransferConfig>(transfer).ok())
            .unwrap_or_default()
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// WorkDrive 目录 + CRM 记录库
    Workdrive,
    /// 本地目录 + JSON 文件记录库
    Local,
}

/// 数据中心区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Region {
    Com,
    Eu,
    In,
    Au,
    Jp,
}

impl Region {
    fn domain(self) -> &'static str {
        match self {
            Region::Com => "com",
            Region::Eu => "eu",
            Region::In => "in",
            Region::Au => "com.au",
            Region::Jp => "jp",
        }
    }

    pub fn api_base_url(self) -> String {
        format!("https://www.zohoapis.{}", self.domain())
    }

    pub fn accounts_base_url(self) -> String {
        format!("https://accounts.zoho.{}", self.domain())
    }
}

/// 命令行参数
#[derive(Debug, Clone, Parser)]
#[command(
    name = "drivemirror",
    version,
    about = "把记录库中待处理记录对应的文件夹从源租户镜像到目标租户"
)]
pub struct Cli {
    /// 只读取和解析，不创建文件夹、不上传、不写回
    #[arg(long)]
    pub dry_run: bool,

    /// 只处理指定记录
    #[arg(long)]
    pub record_id: Option<String>,

    /// 最多处理的记录数
    #[arg(long, conflicts_with = "record_id")]
    pub limit: Option<usize>,

    #[arg(long, value_enum, env = "DRIVEMIRROR_BACKEND", default_value = "workdrive")]
    pub backend: Backend,

    /// 源文件夹未找到或不唯一而跳过的记录不计为失败
    #[arg(long, env = "DRIVEMIRROR_ALLOW_UNRESOLVED")]
    pub allow_unresolved: bool,

    /// 检查两个租户的凭据和根目录后退出
    #[arg(long, conflicts_with = "list_pending")]
    pub check_connection: bool,

    /// 列出待处理记录后退出
    #[arg(long)]
    pub list_pending: bool,

    /// 覆盖 config.json 中的最大并发传输数
    #[arg(long, env = "DRIVEMIRROR_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// 数据目录（config.json、日志、审计文件）
    #[arg(long, env = "DRIVEMIRROR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, value_enum, env = "API_REGION", default_value = "com")]
    pub region: Region,

    #[arg(long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    #[arg(long, env = "ACCOUNTS_BASE_URL")]
    pub accounts_base_url: Option<String>,

    #[arg(long, env = "SOURCE_CLIENT_ID")]
    pub source_client_id: Option<String>,

    #[arg(long, env = "SOURCE_CLIENT_SECRET", hide_env_values = true)]
    pub source_client_secret: Option<String>,

    #[arg(long, env = "SOURCE_REFRESH_TOKEN", hide_env_values = true)]
    pub source_refresh_token: Option<String>,

    /// 源租户中的搜索范围根目录
    #[arg(long, env = "SOURCE_SCOPE_ROOT_ID")]
    pub source_scope_root_id: Option<String>,

    #[arg(long, env = "DEST_CLIENT_ID")]
    pub dest_client_id: Option<String>,

    #[arg(long, env = "DEST_CLIENT_SECRET", hide_env_values = true)]
    pub dest_client_secret: Option<String>,

    #[arg(long, env = "DEST_REFRESH_TOKEN", hide_env_values = true)]
    pub dest_refresh_token: Option<String>,

    /// 默认目标根目录
    #[arg(long, env = "DEST_ROOT_FOLDER_ID")]
    pub dest_root_folder_id: Option<String>,

    #[arg(long, env = "REGISTRY_MODULE")]
    pub registry_module: Option<String>,

    /// 完成标记字段
    #[arg(long, env = "REGISTRY_FLAG_FIELD")]
    pub registry_flag_field: Option<String>,

    /// 源文件夹名称字段
    #[arg(long, env = "REGISTRY_FOLDER_NAME_FIELD")]
    pub registry_folder_name_field: Option<String>,

    #[arg(long, env = "REGISTRY_DEST_OVERRIDE_FIELD")]
    pub registry_dest_override_field: Option<String>,

    #[arg(long, env = "REGISTRY_PREFERRED_PARENT_FIELD")]
    pub registry_preferred_parent_field: Option<String>,

    #[arg(long, env = "REGISTRY_REFERENCE_FIELDS", value_delimiter = ',')]
    pub registry_reference_fields: Vec<String>,

    #[arg(long, env = "LOCAL_SOURCE_ROOT")]
    pub local_source_root: Option<PathBuf>,

    #[arg(long, env = "LOCAL_DEST_ROOT")]
    pub local_dest_root: Option<PathBuf>,

    #[arg(long, env = "LOCAL_REGISTRY_FILE")]
    pub local_registry_file: Option<PathBuf>,
}

/// 要执行的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    CheckConnection,
    ListPending,
}

#[derive(Debug, Clone)]
pub struct WorkDriveConfig {
    pub api_base_url: String,
    pub token_url: String,
    pub source: OAuthClientConfig,
    pub destination: OAuthClientConfig,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub registry_file: PathBuf,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    WorkDrive(WorkDriveConfig),
    Local(LocalConfig),
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub module: String,
    pub fields: RecordFields,
}

/// 校验后的完整配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub command: Command,
    pub backend: BackendConfig,
    pub registry: RegistryConfig,
    pub transfer: TransferConfig,
    pub scope_root_id: String,
    pub dest_root_id: String,
    pub data_dir: PathBuf,
    pub dry_run: bool,
    pub allow_unresolved: bool,
    pub record_id: Option<String>,
    pub limit: Option<usize>,
}

/// 收集缺失的必需变量
struct Required {
    missing: Vec<&'static str>,
}

impl Required {
    fn take<T>(&mut self, value: Option<T>, name: &'static str) -> Option<T> {
        if value.is_none() {
            self.missing.push(name);
        }
        value
    }

    fn text(&mut self, value: Option<String>, name: &'static str) -> String {
        let value = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        self.take(value, name).unwrap_or_default()
    }

    fn path(&mut self, value: Option<PathBuf>, name: &'static str) -> PathBuf {
        self.take(value, name).unwrap_or_default()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Cli {
    pub fn command(&self) -> Command {
        if self.check_connection {
            Command::CheckConnection
        } else if self.list_pending {
            Command::ListPending
        } else {
            Command::Run
        }
    }

    /// 未指定数据目录时使用系统配置目录下的 drivemirror
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            crate::dirs::config_dir()
                .map(|p| p.join("drivemirror"))
                .unwrap_or_else(|| PathBuf::from(".drivemirror"))
        })
    }

    /// 校验并生成 AppConfig，一次列出所有缺失的变量
    pub fn into_config(self) -> Result<AppConfig, ConfigError> {
        let data_dir = self.resolve_data_dir();
        let command = self.command();
        let mut required = Required { missing: Vec::new() };

        let (backend, scope_root_id, dest_root_id, module, flag, folder_name) = match self.backend
        {
            Backend::Workdrive => {
                let source = OAuthClientConfig {
                    client_id: required.text(self.source_client_id, "SOURCE_CLIENT_ID"),
                    client_secret: required.text(self.source_client_secret, "SOURCE_CLIENT_SECRET"),
                    refresh_token: required.text(self.source_refresh_token, "SOURCE_REFRESH_TOKEN"),
                };
                let destination = OAuthClientConfig {
                    client_id: required.text(self.dest_client_id, "DEST_CLIENT_ID"),
                    client_secret: required.text(self.dest_client_secret, "DEST_CLIENT_SECRET"),
                    refresh_token: required.text(self.dest_refresh_token, "DEST_REFRESH_TOKEN"),
                };
                let scope = required.text(self.source_scope_root_id, "SOURCE_SCOPE_ROOT_ID");
                let dest = required.text(self.dest_root_folder_id, "DEST_ROOT_FOLDER_ID");
                let module = required.text(self.registry_module, "REGISTRY_MODULE");
                let flag = required.text(self.registry_flag_field, "REGISTRY_FLAG_FIELD");
                let folder_name =
                    required.text(self.registry_folder_name_field, "REGISTRY_FOLDER_NAME_FIELD");

                let api_base_url = non_empty(self.api_base_url)
                    .unwrap_or_else(|| self.region.api_base_url());
                let accounts = non_empty(self.accounts_base_url)
                    .unwrap_or_else(|| self.region.accounts_base_url());
                let token_url = format!("{}/oauth/v2/token", accounts.trim_end_matches('/'));

                (
                    BackendConfig::WorkDrive(WorkDriveConfig {
                        api_base_url,
                        token_url,
                        source,
                        destination,
                    }),
                    scope,
                    dest,
                    module,
                    flag,
                    folder_name,
                )
            }
            Backend::Local => {
                let local = LocalConfig {
                    source_root: required.path(self.local_source_root, "LOCAL_SOURCE_ROOT"),
                    dest_root: required.path(self.local_dest_root, "LOCAL_DEST_ROOT"),
                    registry_file: required.path(self.local_registry_file, "LOCAL_REGISTRY_FILE"),
                };
                (
                    BackendConfig::Local(local),
                    non_empty(self.source_scope_root_id).unwrap_or_default(),
                    non_empty(self.dest_root_folder_id).unwrap_or_default(),
                    non_empty(self.registry_module).unwrap_or_else(|| "records".to_string()),
                    non_empty(self.registry_flag_field).unwrap_or_else(|| "transferred".to_string()),
                    non_empty(self.registry_folder_name_field)
                        .unwrap_or_else(|| "folder_name".to_string()),
                )
            }
        };

        if !required.missing.is_empty() {
            return Err(ConfigError(format!(
                "缺少必需的配置: {}",
                required.missing.join(", ")
            )));
        }

        if self.limit == Some(0) {
            return Err(ConfigError("--limit 必须大于 0".to_string()));
        }

        let mut transfer = TransferConfig::load(&data_dir);
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err(ConfigError("--concurrency 必须大于 0".to_string()));
            }
            transfer.max_concurrent_transfers = concurrency;
        }

        let fields = RecordFields {
            flag,
            folder_name,
            dest_override: non_empty(self.registry_dest_override_field),
            preferred_parent: non_empty(self.registry_preferred_parent_field),
            references: self
                .registry_reference_fields
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        };

        Ok(AppConfig {
            command,
            backend,
            registry: RegistryConfig { module, fields },
            transfer,
            scope_root_id,
            dest_root_id,
            data_dir,
            dry_run: self.dry_run,
            allow_unresolved: self.allow_unresolved,
            record_id: non_empty(self.record_id),
            limit: self.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workdrive_args(data_dir: &Path) -> Vec<String> {
        [
            "drivemirror",
            "--backend",
            "workdrive",
            "--source-client-id",
            "sid",
            "--source-client-secret",
            "ssecret",
            "--source-refresh-token",
            "srt",
            "--source-scope-root-id",
            "team-1",
            "--dest-client-id",
            "did",
            "--dest-client-secret",
            "dsecret",
            "--dest-refresh-token",
            "drt",
            "--dest-root-folder-id",
            "dest-root",
            "--registry-module",
            "Deals",
            "--registry-flag-field",
            "Transferred",
            "--registry-folder-name-field",
            "Folder_Name",
            "--region",
            "eu",
            "--data-dir",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(data_dir.display().to_string()))
        .collect()
    }

    #[test]
    fn test_workdrive_config_uses_region_endpoints() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from(workdrive_args(dir.path())).unwrap();
        let config = cli.into_config().unwrap();

        match &config.backend {
            BackendConfig::WorkDrive(wd) => {
                assert_eq!(wd.api_base_url, "https://www.zohoapis.eu");
                assert_eq!(wd.token_url, "https://accounts.zoho.eu/oauth/v2/token");
                assert_eq!(wd.source.client_id, "sid");
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(config.scope_root_id, "team-1");
        assert_eq!(config.registry.fields.flag, "Transferred");
        assert_eq!(config.transfer, TransferConfig::default());
        assert_eq!(config.command, Command::Run);
        assert!(!config.allow_unresolved);

        let mut args = workdrive_args(dir.path());
        args.push("--allow-unresolved".to_string());
        let config = Cli::try_parse_from(args).unwrap().into_config().unwrap();
        assert!(config.allow_unresolved);
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        let dir = TempDir::new().unwrap();
        let args = vec![
            "drivemirror".to_string(),
            "--backend".to_string(),
            "workdrive".to_string(),
            "--source-client-id".to_string(),
            "sid".to_string(),
            "--data-dir".to_string(),
            dir.path().display().to_string(),
        ];
        let err = Cli::try_parse_from(args).unwrap().into_config().unwrap_err();
        assert!(err.0.contains("SOURCE_CLIENT_SECRET"));
        assert!(err.0.contains("DEST_ROOT_FOLDER_ID"));
        assert!(err.0.contains("REGISTRY_MODULE"));
        assert!(!err.0.contains("SOURCE_CLIENT_ID,"));
    }

    #[test]
    fn test_transfer_config_from_file_and_cli_override() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"transfer": {"maxConcurrentTransfers": 8, "pageSize": 20, "nestUnderFolderName": true}, "log": {"level": "debug"}}"#,
        )
        .unwrap();

        let loaded = TransferConfig::load(dir.path());
        assert_eq!(loaded.max_concurrent_transfers, 8);
        assert_eq!(loaded.page_size, 20);
        assert_eq!(loaded.max_attempts, 3);
        assert!(loaded.nest_under_folder_name);

        let mut args = workdrive_args(dir.path());
        args.extend(["--concurrency".to_string(), "2".to_string()]);
        let config = Cli::try_parse_from(args).unwrap().into_config().unwrap();
        assert_eq!(config.transfer.max_concurrent_transfers, 2);
        assert_eq!(config.transfer.page_size, 20);
    }

    #[test]
    fn test_local_backend_defaults() {
        let dir = TempDir::new().unwrap();
        let args = vec![
            "drivemirror".to_string(),
            "--backend".to_string(),
            "local".to_string(),
            "--local-source-root".to_string(),
            "/tmp/src".to_string(),
            "--local-dest-root".to_string(),
            "/tmp/dst".to_string(),
            "--local-registry-file".to_string(),
            "/tmp/records.json".to_string(),
            "--data-dir".to_string(),
            dir.path().display().to_string(),
            "--list-pending".to_string(),
        ];
        let config = Cli::try_parse_from(args).unwrap().into_config().unwrap();
        assert!(matches!(config.backend, BackendConfig::Local(_)));
        assert_eq!(config.registry.fields.folder_name, "folder_name");
        assert_eq!(config.scope_root_id, "");
        assert_eq!(config.command, Command::ListPending);
    }

    #[test]
    fn test_record_id_conflicts_with_limit() {
        let dir = TempDir::new().unwrap();
        let mut args = workdrive_args(dir.path());
        args.extend([
            "--record-id".to_string(),
            "42".to_string(),
            "--limit".to_string(),
            "3".to_string(),
        ]);
        assert!(Cli::try_parse_from(args).is_err());
    }
}
