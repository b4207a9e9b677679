pub mod local;
#[cfg(test)]
pub mod memory;
pub mod workdrive;

use crate::auth::{CredentialProvider, Tenant};
use crate::config::{AppConfig, BackendConfig};
use crate::error::ApiError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

pub use local::LocalDirectory;
pub use workdrive::WorkDriveClient;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- 搜索、列表、建目录
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 下载、上传
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 字节流（下载结果直接作为上传请求体）
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// 搜索返回的候选文件夹
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderCandidate {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// 最后修改时间（毫秒时间戳）
    pub modified_time: i64,
}

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// 目录节点（列表接口的单个条目）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// 仅文件有大小
    pub size: Option<u64>,
}

impl DirectoryNode {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// 分页列表的一页
#[derive(Debug, Clone, Default)]
pub struct ChildPage {
    pub items: Vec<DirectoryNode>,
    /// 下一页游标，None 表示已到末页
    pub next: Option<String>,
}

/// 上传完成后的文件信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
}

/// 源目录（只读）
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    /// 在 scope_root_id 下按名称搜索文件夹（服务端搜索，可能返回非精确匹配）
    async fn search_folder(
        &self,
        scope_root_id: &str,
        name: &str,
    ) -> Result<Vec<FolderCandidate>, ApiError>;

    /// 列出文件夹的一页子节点
    async fn list_children(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildPage, ApiError>;

    /// 打开文件下载流
    async fn open_download(&self, file_id: &str) -> Result<ByteStream, ApiError>;

    /// 检查文件夹是否存在
    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 目标目录（可写）
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    /// 在 parent_id 下查找或创建名为 name 的文件夹，返回其 ID
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, ApiError>;

    /// 目标端实际写入的文件名；重名检查基于此结果
    fn normalize_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// 列出文件夹中已有的文件名
    async fn list_names(&self, folder_id: &str) -> Result<HashSet<String>, ApiError>;

    /// 流式上传（请求体直接消费下载流，不整体缓存）
    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        body: ByteStream,
        size: Option<u64>,
    ) -> Result<UploadedFile, ApiError>;

    /// 检查文件夹是否存在
    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 源目录与目标目录
#[derive(Clone)]
pub struct Directories {
    pub source: Arc<dyn SourceDirectory>,
    pub destination: Arc<dyn DestinationDirectory>,
}

/// 根据配置创建目录实例
pub fn create_directories(
    config: &AppConfig,
    http: &reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Directories> {
    match &config.backend {
        BackendConfig::WorkDrive(wd) => {
            tracing::info!("初始化 WorkDrive 目录: {}", wd.api_base_url);
            let source = WorkDriveClient::new(
                http.clone(),
                &wd.api_base_url,
                Tenant::Source,
                credentials.clone(),
                config.transfer.page_size,
            );
            let destination = WorkDriveClient::new(
                http.clone(),
                &wd.api_base_url,
                Tenant::Destination,
                credentials,
                config.transfer.page_size,
            );
            Ok(Directories {
                source: Arc::new(source),
                destination: Arc::new(destination),
            })
        }
        BackendConfig::Local(local) => {
            tracing::info!(
                "初始化本地目录: source={:?}, dest={:?}",
                local.source_root,
                local.dest_root
            );
            let source = LocalDirectory::new(&local.source_root, config.transfer.page_size)?;
            let destination = LocalDirectory::new(&local.dest_root, config.transfer.page_size)?;
            Ok(Directories {
                source: Arc::new(source),
                destination: Arc::new(destination),
            })
        }
    }
}
